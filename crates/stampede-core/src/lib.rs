//! Weighted virtual-user HTTP load generation.
//!
//! This crate provides:
//! - A scenario registry with weighted selection and tag filtering
//! - Request templates loaded from YAML scenario files
//! - A scheduler that ramps virtual users up and down and stops them
//!   gracefully or immediately
//! - A sharded streaming aggregator with HDR percentiles, history sampling
//!   and CSV export

pub mod aggregator;
pub mod credentials;
pub mod error;
pub mod export;
pub mod history;
pub mod outcome;
pub mod registry;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod template;
pub mod think;
pub mod transport;
pub mod weights;

pub use aggregator::{Aggregator, AggregatorConfig, RunSummary, StatsRow, PERCENTILES};
pub use credentials::Credentials;
pub use error::{LoadError, LoadResult, TransportError};
pub use export::export_csv;
pub use history::{History, HistoryRow, HistorySampler};
pub use outcome::{FailureKind, OutcomeKind, RequestOutcome};
pub use registry::{ScenarioRegistry, TagFilter};
pub use runner::{RunContext, StopMode, UserExit, VirtualUser};
pub use scenario::{ActionDefinition, RequestTemplate, ScenarioDefinition, ScenarioFile};
pub use scheduler::{RunHandle, RunStatus, Scheduler, SchedulerConfig, SpawnPlan, StopReason, StopReport, Stopper};
pub use think::ThinkTime;
pub use transport::{HttpTransport, PreparedRequest, Transport, TransportResponse};
