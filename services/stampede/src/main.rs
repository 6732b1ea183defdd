//! stampede: weighted virtual-user load generator.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

use stampede::{
    list_scenarios, quick_test, run_load_test, Cli, Commands, LoadedScenario, OutputFormat,
    ResultsReport, RunArgs, RunConfig,
};

/// Exit code for configuration and runtime errors; 1 is reserved for
/// threshold violations.
const EXIT_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Quick(args) => quick(args).await,
        Commands::List { dir } => list(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Load test aborted");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: RunArgs) -> anyhow::Result<u8> {
    let loaded = LoadedScenario::from_file(&args.scenario)?;
    let registry = loaded.registry()?;
    let config = RunConfig::resolve(&loaded.run, &args)?;
    if let Some(addr) = config.metrics_addr {
        stampede::metrics::install_exporter(addr)?;
    }

    if config.output == OutputFormat::Table {
        println!("Loading scenario: {}", args.scenario.display());
        println!("  Name: {}", loaded.file.name);
        println!("  Host: {}", config.host);
        println!("  Users: {} @ {}/s", config.users, config.spawn_rate);
        match config.run_time {
            Some(run_time) => println!("  Run time: {}s", run_time.as_secs()),
            None => println!("  Run time: until Ctrl+C"),
        }
        println!("  Scenarios: {}", registry.len());
        println!();
    }

    let outcome = run_load_test(&registry, &config).await?;

    match config.output {
        OutputFormat::Json => {
            println!(
                "{}",
                ResultsReport::format_json(&outcome.summary, &outcome.stop, &outcome.verdict)?
            );
        }
        OutputFormat::Table => {
            println!("{}", ResultsReport::format_requests(&outcome.summary));
            if let Some(tags) = ResultsReport::format_tags(&outcome.summary) {
                println!("{}", tags);
            }
            if let Some(failures) = ResultsReport::format_failures(&outcome.summary) {
                println!("{}", failures);
            }
            println!(
                "{}",
                ResultsReport::format_summary(&outcome.summary, &outcome.stop, &outcome.verdict)
            );
            for path in &outcome.csv_files {
                println!("  wrote {}", path.display());
            }
        }
    }

    Ok(outcome.verdict.exit_code())
}

async fn quick(args: stampede::QuickArgs) -> anyhow::Result<u8> {
    println!("Running quick test:");
    println!("  URL: {}{}", args.host, args.path);
    println!("  Requests: {}", args.requests);
    println!("  Concurrency: {}", args.concurrency);
    println!();

    let summary = quick_test(&args).await?;
    println!("{}", ResultsReport::format_requests(&summary));
    if let Some(failures) = ResultsReport::format_failures(&summary) {
        println!("{}", failures);
    }
    Ok(if summary.total.failures == 0 { 0 } else { 1 })
}

fn list(dir: &std::path::Path) -> anyhow::Result<u8> {
    println!("Available scenarios in {}:", dir.display());
    println!();

    let listings = list_scenarios(dir)?;
    if listings.is_empty() {
        println!("No scenario files found");
    }
    for listing in listings {
        println!("  {} - {}", listing.file_name, listing.name);
        if !listing.description.is_empty() {
            println!("    {}", listing.description);
        }
        for (archetype, weight, tags) in listing.scenarios {
            println!("    {:<24} weight {:<4} [{}]", archetype, weight, tags.join(", "));
        }
        println!();
    }
    Ok(0)
}
