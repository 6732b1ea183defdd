//! Command-line load generator for HTTP backends.
//!
//! This crate provides:
//! - Run configuration layered from scenario files, flags and environment
//! - Orchestration of a run with live progress and Ctrl+C handling
//! - Console and JSON reports with a pass/fail threshold gate
//! - Live Prometheus metrics while a run is in progress

pub mod app;
pub mod cli;
pub mod config;
pub mod metrics;
pub mod progress;
pub mod report;

pub use app::{list_scenarios, quick_test, run_load_test, run_with_transport, RunOutcome};
pub use cli::{Cli, Commands, OutputFormat, QuickArgs, RunArgs};
pub use config::{parse_run_time, LoadedScenario, RunConfig, RunSection, Thresholds};
pub use report::{evaluate, ResultsReport, ThresholdVerdict};
