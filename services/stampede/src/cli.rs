//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use stampede_core::credentials::{DEFAULT_TENANT_HEADER, DEFAULT_TOKEN};

#[derive(Parser, Debug)]
#[command(name = "stampede")]
#[command(about = "Load generator simulating weighted virtual users against an HTTP backend", long_about = None)]
pub struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a load test from a scenario file
    Run(RunArgs),

    /// Send a fixed number of requests to one endpoint
    Quick(QuickArgs),

    /// List available scenario files
    List {
        /// Scenarios directory
        #[arg(short, long, default_value = "scenarios")]
        dir: PathBuf,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Path to scenario YAML file
    #[arg(short, long, env = "STAMPEDE_SCENARIO", default_value = "scenarios/agentspace.yaml")]
    pub scenario: PathBuf,

    /// Target host, e.g. http://localhost:8000
    #[arg(long, env = "STAMPEDE_HOST")]
    pub host: Option<String>,

    /// Peak number of concurrent users
    #[arg(short, long)]
    pub users: Option<usize>,

    /// Users started per second
    #[arg(short = 'r', long)]
    pub spawn_rate: Option<f64>,

    /// Stop after this long (90, 60s, 5m, 1h30m)
    #[arg(short = 't', long)]
    pub run_time: Option<String>,

    /// Only run actions with one of these tags
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Skip actions with any of these tags
    #[arg(long, value_delimiter = ',')]
    pub exclude_tags: Vec<String>,

    /// No progress bar; log live stats instead
    #[arg(long)]
    pub headless: bool,

    /// Write CSV results with this path prefix
    #[arg(long)]
    pub csv: Option<String>,

    /// Output format for the final report
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,

    /// RNG seed for reproducible scenario and action selection
    #[arg(long)]
    pub seed: Option<u64>,

    /// How long a graceful stop may take before in-flight requests are cancelled
    #[arg(long)]
    pub stop_timeout: Option<String>,

    /// Per-request timeout
    #[arg(long)]
    pub request_timeout: Option<String>,

    /// Reset statistics once all users have spawned
    #[arg(long)]
    pub reset_stats: bool,

    /// Fail if the error rate (0.0-1.0) exceeds this value
    #[arg(long)]
    pub max_error_rate: Option<f64>,

    /// Fail if the aggregated p95 latency exceeds this many milliseconds
    #[arg(long)]
    pub max_p95_ms: Option<f64>,

    /// Fail if the aggregated p99 latency exceeds this many milliseconds
    #[arg(long)]
    pub max_p99_ms: Option<f64>,

    /// Bearer token sent with every request
    #[arg(long, env = "TEST_AUTH_TOKEN", default_value = DEFAULT_TOKEN)]
    pub auth_token: String,

    /// Tenant identifier (defaults to a random UUID)
    #[arg(long, env = "TEST_AGENCY_ID")]
    pub agency_id: Option<String>,

    /// Header carrying the tenant identifier
    #[arg(long, default_value = DEFAULT_TENANT_HEADER)]
    pub tenant_header: String,

    /// Serve live Prometheus metrics on this address, e.g. 0.0.0.0:9646
    #[arg(long, env = "STAMPEDE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Args, Debug, Clone)]
pub struct QuickArgs {
    /// Target host
    #[arg(long, env = "STAMPEDE_HOST", default_value = "http://localhost:8000")]
    pub host: String,

    /// Endpoint path
    #[arg(short, long, default_value = "/api/health/")]
    pub path: String,

    /// Number of requests
    #[arg(short = 'n', long, default_value = "100")]
    pub requests: u64,

    /// Requests in flight at once
    #[arg(short, long, default_value = "5")]
    pub concurrency: usize,

    /// Bearer token sent with every request
    #[arg(long, env = "TEST_AUTH_TOKEN", default_value = DEFAULT_TOKEN)]
    pub auth_token: String,

    /// Tenant identifier (defaults to a random UUID)
    #[arg(long, env = "TEST_AGENCY_ID")]
    pub agency_id: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}
