//! Run orchestration: wire the transport, aggregator and scheduler together,
//! watch the run, and collect results.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Method;
use stampede_core::transport::{join_url, parse_host};
use stampede_core::{
    export_csv, Aggregator, AggregatorConfig, Credentials, FailureKind, History, HistorySampler,
    HttpTransport, OutcomeKind, PreparedRequest, RequestOutcome, RunContext, RunSummary,
    ScenarioRegistry, Scheduler, SchedulerConfig, SpawnPlan, StopReport, Transport,
};
use tracing::{info, instrument, warn};

use crate::cli::QuickArgs;
use crate::config::{LoadedScenario, RunConfig};
use crate::metrics::MetricsPublisher;
use crate::progress::RunProgress;
use crate::report::{evaluate, ThresholdVerdict};

/// Interval between history samples.
pub const HISTORY_INTERVAL: Duration = Duration::from_secs(1);
/// Rows kept in the history; a day of one-second samples.
pub const HISTORY_LIMIT: usize = 86_400;

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub history: History,
    pub stop: StopReport,
    pub verdict: ThresholdVerdict,
    pub csv_files: Vec<PathBuf>,
}

/// Run a load test against the configured host over HTTP.
pub async fn run_load_test(registry: &ScenarioRegistry, config: &RunConfig) -> anyhow::Result<RunOutcome> {
    let transport = HttpTransport::new(config.request_timeout, config.users.max(10))?;
    run_with_transport(registry, config, Arc::new(transport)).await
}

/// Run a load test with an arbitrary transport.
#[instrument(skip_all, fields(host = %config.host, users = config.users, spawn_rate = config.spawn_rate))]
pub async fn run_with_transport(
    registry: &ScenarioRegistry,
    config: &RunConfig,
    transport: Arc<dyn Transport>,
) -> anyhow::Result<RunOutcome> {
    let aggregator = Arc::new(Aggregator::new(AggregatorConfig::default())?);
    let ctx = RunContext::new(
        config.host.clone(),
        &config.credentials,
        transport,
        aggregator.clone(),
    )?;

    let scheduler = Scheduler::new(
        registry,
        Arc::new(ctx),
        SchedulerConfig {
            stop_timeout: config.stop_timeout,
            seed: config.seed,
            tag_filter: config.tag_filter.clone(),
            ..SchedulerConfig::default()
        },
    )?;

    let mut plan = SpawnPlan::new(config.users, config.spawn_rate);
    if let Some(run_time) = config.run_time {
        plan = plan.with_duration(run_time);
    }

    info!(
        scenarios = scheduler.registry().len(),
        run_time_secs = config.run_time.map(|d| d.as_secs()),
        tenant = %config.credentials.tenant_id,
        "Run configuration resolved"
    );

    let handle = scheduler.start(plan)?;
    let sampler = HistorySampler::spawn(
        aggregator.clone(),
        handle.user_gauge(),
        HISTORY_INTERVAL,
        HISTORY_LIMIT,
        config.headless,
    );
    let progress = if config.headless {
        None
    } else {
        Some(RunProgress::start(
            aggregator.clone(),
            handle.user_gauge(),
            config.run_time,
        )?)
    };

    let publisher = config
        .metrics_addr
        .map(|_| MetricsPublisher::spawn(aggregator.clone(), handle.user_gauge()));

    let stopper = handle.stopper();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, stopping users (press Ctrl+C again to cancel in-flight requests)");
        stopper.stop().await;
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt, cancelling in-flight requests");
            stopper.cancel().await;
        }
    });

    if config.reset_stats {
        let status = handle.ramp_complete().await;
        if !status.stopping {
            aggregator.reset();
            info!(users = status.active_users, "All users spawned, statistics reset");
        }
    }

    let stop = handle.wait().await?;
    signals.abort();
    if let Some(progress) = progress {
        progress.finish().await;
    }
    if let Some(publisher) = publisher {
        publisher.finish().await;
    }
    let history = sampler.finish(&aggregator, 0).await;

    let summary = aggregator.snapshot();
    let verdict = evaluate(&summary, &config.thresholds);
    info!(
        reason = ?stop.reason,
        requests = summary.total.requests,
        failures = summary.total.failures,
        rps = summary.throughput,
        p95_ms = summary.p95_ms,
        passed = verdict.passed,
        "Load test finished"
    );

    let csv_files = match &config.csv_prefix {
        Some(prefix) => {
            let files = export_csv(prefix, &summary, &history)
                .with_context(|| format!("Failed to write CSV results to {}", prefix))?;
            info!(files = files.len(), prefix = %prefix, "CSV results written");
            files
        }
        None => Vec::new(),
    };

    Ok(RunOutcome {
        summary,
        history,
        stop,
        verdict,
        csv_files,
    })
}

/// Send `args.requests` GETs to one endpoint with bounded concurrency.
pub async fn quick_test(args: &QuickArgs) -> anyhow::Result<RunSummary> {
    let transport = HttpTransport::new(Duration::from_secs(30), args.concurrency.max(1))?;
    quick_test_with(args, Arc::new(transport)).await
}

pub async fn quick_test_with(args: &QuickArgs, transport: Arc<dyn Transport>) -> anyhow::Result<RunSummary> {
    if args.concurrency == 0 {
        anyhow::bail!("concurrency must be > 0");
    }
    let host = parse_host(&args.host)?;
    let url = join_url(&host, &args.path).map_err(|e| anyhow::anyhow!("{}", e))?;
    let credentials = Credentials::new(
        args.auth_token.clone(),
        args.agency_id
            .clone()
            .unwrap_or_else(|| Credentials::anonymous().tenant_id),
    );
    let headers = credentials.headers()?;
    let aggregator = Aggregator::new(AggregatorConfig::default())?;

    let mut outcomes = futures::stream::iter(0..args.requests)
        .map(|request_id| {
            let transport = transport.clone();
            let request = PreparedRequest {
                method: Method::GET,
                url: url.clone(),
                query: Vec::new(),
                headers: headers.clone(),
                body: None,
            };
            async move {
                let started_at = Utc::now();
                let started = Instant::now();
                let result = transport.send(request).await;
                let latency = started.elapsed();
                let (kind, bytes) = match result {
                    Ok(response) if (200..300).contains(&response.status) => (
                        OutcomeKind::Success {
                            status: response.status,
                        },
                        response.body.len() as u64,
                    ),
                    Ok(response) => (
                        OutcomeKind::Failure(FailureKind::Status(response.status)),
                        response.body.len() as u64,
                    ),
                    Err(err) => (OutcomeKind::Failure(err.into()), 0),
                };
                RequestOutcome {
                    request_id,
                    user_id: request_id,
                    method: Method::GET,
                    name: args.path.clone(),
                    tags: Vec::<String>::new().into(),
                    started_at,
                    latency,
                    bytes,
                    kind,
                }
            }
        })
        .buffer_unordered(args.concurrency);

    while let Some(outcome) = outcomes.next().await {
        aggregator.record(&outcome);
    }
    Ok(aggregator.snapshot())
}

/// One scenario file found by `list`.
#[derive(Debug, Clone)]
pub struct ScenarioListing {
    pub file_name: String,
    pub name: String,
    pub description: String,
    /// (archetype, weight, tags) per scenario.
    pub scenarios: Vec<(String, f64, Vec<String>)>,
}

/// Scenario files in `dir`, sorted by file name. Files that fail to load are
/// skipped with a warning.
pub fn list_scenarios(dir: &Path) -> anyhow::Result<Vec<ScenarioListing>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Error reading directory {}", dir.display()))?;

    let mut listings = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yaml") | Some("yml")
        );
        if !is_yaml {
            continue;
        }
        let loaded = match LoadedScenario::from_file(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping invalid scenario file");
                continue;
            }
        };
        let scenarios = match loaded.registry() {
            Ok(registry) => registry
                .scenarios()
                .iter()
                .map(|s| {
                    (
                        s.name.clone(),
                        s.weight,
                        s.tags().into_iter().map(String::from).collect(),
                    )
                })
                .collect(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping invalid scenario file");
                continue;
            }
        };
        listings.push(ScenarioListing {
            file_name: entry.file_name().to_string_lossy().to_string(),
            name: loaded.file.name,
            description: loaded.file.description,
            scenarios,
        });
    }

    listings.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(listings)
}
