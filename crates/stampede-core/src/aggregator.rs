//! Streaming statistics over request outcomes.
//!
//! Producers (one per virtual user) record into the shard picked by their
//! user id, so concurrent users rarely contend on the same lock. Readers merge
//! all shards into a [`RunSummary`]. Latencies go into HDR histograms with
//! fixed bounds: memory stays constant however long the run is, and
//! percentiles carry the histogram's relative error.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LoadError, LoadResult};
use crate::outcome::RequestOutcome;

/// Percentiles reported for every row, as quantiles.
pub const PERCENTILES: [f64; 11] = [
    0.50, 0.66, 0.75, 0.80, 0.90, 0.95, 0.98, 0.99, 0.999, 0.9999, 1.0,
];

/// Name that absorbs requests, failure groups and exception messages once
/// their cardinality cap is reached.
pub const OVERFLOW_NAME: &str = "[overflow]";

/// Sizing of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Number of independently locked shards.
    pub shards: usize,
    /// Histogram ceiling; slower requests are clamped to it.
    pub max_latency: Duration,
    /// Significant figures kept by the histograms (1-5).
    pub significant_figures: u8,
    /// Distinct entries tracked per table (request names, failure groups,
    /// exception messages) before folding into `[overflow]`.
    pub max_entries: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            shards: 8,
            max_latency: Duration::from_secs(600),
            significant_figures: 2,
            max_entries: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct StatKey {
    method: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct FailureKey {
    method: String,
    name: String,
    error: String,
}

/// Counters and latency histogram for one grouping (request name, tag, or total).
#[derive(Debug, Clone)]
struct StatsEntry {
    histogram: Histogram<u64>,
    requests: u64,
    failures: u64,
    bytes: u64,
    latency_sum_us: u128,
    min_us: Option<u64>,
    max_us: u64,
    clamped: u64,
    first_start: Option<DateTime<Utc>>,
    last_end: Option<DateTime<Utc>>,
}

impl StatsEntry {
    fn new(template: &Histogram<u64>) -> Self {
        Self {
            histogram: Histogram::new_from(template),
            requests: 0,
            failures: 0,
            bytes: 0,
            latency_sum_us: 0,
            min_us: None,
            max_us: 0,
            clamped: 0,
            first_start: None,
            last_end: None,
        }
    }

    fn record(&mut self, outcome: &RequestOutcome) {
        let latency_us = (outcome.latency.as_micros() as u64).max(1);
        self.requests += 1;
        if !outcome.is_success() {
            self.failures += 1;
        }
        self.bytes += outcome.bytes;
        self.latency_sum_us += u128::from(latency_us);
        self.min_us = Some(self.min_us.map_or(latency_us, |m| m.min(latency_us)));
        self.max_us = self.max_us.max(latency_us);

        if latency_us > self.histogram.high() {
            self.clamped += 1;
        }
        self.histogram.saturating_record(latency_us);

        let end = outcome.finished_at();
        self.first_start = Some(
            self.first_start
                .map_or(outcome.started_at, |s| s.min(outcome.started_at)),
        );
        self.last_end = Some(self.last_end.map_or(end, |e| e.max(end)));
    }

    fn merge(&mut self, other: &StatsEntry) {
        self.requests += other.requests;
        self.failures += other.failures;
        self.bytes += other.bytes;
        self.latency_sum_us += other.latency_sum_us;
        self.min_us = match (self.min_us, other.min_us) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_us = self.max_us.max(other.max_us);
        self.clamped += other.clamped;
        if let Err(e) = self.histogram.add(&other.histogram) {
            warn!(error = %e, "Failed to merge latency histogram");
        }
        self.first_start = match (self.first_start, other.first_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_end = match (self.last_end, other.last_end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    fn row(&self, method: &str, name: &str, span_secs: f64) -> StatsRow {
        let ms = |us: u64| us as f64 / 1000.0;
        let quantile = |q: f64| {
            if self.requests == 0 {
                0.0
            } else {
                ms(self.histogram.value_at_quantile(q))
            }
        };
        let (rps, failures_per_sec) = if span_secs > 0.0 {
            (
                self.requests as f64 / span_secs,
                self.failures as f64 / span_secs,
            )
        } else {
            (0.0, 0.0)
        };

        StatsRow {
            method: method.to_string(),
            name: name.to_string(),
            requests: self.requests,
            failures: self.failures,
            median_ms: quantile(0.50),
            p95_ms: quantile(0.95),
            p99_ms: quantile(0.99),
            avg_ms: if self.requests > 0 {
                (self.latency_sum_us as f64 / self.requests as f64) / 1000.0
            } else {
                0.0
            },
            min_ms: self.min_us.map_or(0.0, ms),
            max_ms: ms(self.max_us),
            avg_bytes: if self.requests > 0 {
                self.bytes as f64 / self.requests as f64
            } else {
                0.0
            },
            total_bytes: self.bytes,
            rps,
            failures_per_sec,
            percentiles_ms: PERCENTILES.iter().map(|&q| quantile(q)).collect(),
        }
    }
}

#[derive(Debug, Default)]
struct ExceptionEntry {
    count: u64,
    names: BTreeSet<String>,
}

struct Shard {
    requests: HashMap<StatKey, StatsEntry>,
    tags: HashMap<String, StatsEntry>,
    total: StatsEntry,
    failures: HashMap<FailureKey, u64>,
    exceptions: HashMap<String, ExceptionEntry>,
}

impl Shard {
    fn new(template: &Histogram<u64>) -> Self {
        Self {
            requests: HashMap::new(),
            tags: HashMap::new(),
            total: StatsEntry::new(template),
            failures: HashMap::new(),
            exceptions: HashMap::new(),
        }
    }
}

/// Keys admitted into one table across all shards, bounded by a cap.
struct Admitted<K> {
    keys: RwLock<HashSet<K>>,
    overflowed: AtomicU64,
}

enum Admission {
    Tracked,
    /// Cap reached; `first` is set on the first folded key.
    Folded { first: bool },
}

impl<K: Eq + Hash + Clone> Admitted<K> {
    fn new() -> Self {
        Self {
            keys: RwLock::new(HashSet::new()),
            overflowed: AtomicU64::new(0),
        }
    }

    fn admit(&self, key: &K, cap: usize) -> Admission {
        if self.keys.read().contains(key) {
            return Admission::Tracked;
        }
        let mut keys = self.keys.write();
        if keys.contains(key) || keys.len() < cap {
            keys.insert(key.clone());
            return Admission::Tracked;
        }
        drop(keys);
        let first = self.overflowed.fetch_add(1, Ordering::Relaxed) == 0;
        Admission::Folded { first }
    }

    fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.keys.write().clear();
        self.overflowed.store(0, Ordering::Relaxed);
    }
}

/// Shared, concurrency-safe accumulator of request outcomes.
///
/// Every keyed table is bounded by `max_entries`, so memory stays flat even
/// when request names or error messages are unique per request.
pub struct Aggregator {
    config: AggregatorConfig,
    /// Empty histogram every entry is cloned from.
    template: Histogram<u64>,
    shards: Box<[Mutex<Shard>]>,
    names: Admitted<StatKey>,
    failure_groups: Admitted<FailureKey>,
    exception_messages: Admitted<String>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> LoadResult<Self> {
        let ceiling = config.max_latency.as_micros().min(u128::from(u64::MAX)) as u64;
        let template = Histogram::new_with_bounds(1, ceiling, config.significant_figures)
            .map_err(|e| LoadError::InvalidParameter {
                param: "aggregator".to_string(),
                message: format!("invalid histogram bounds: {:?}", e),
            })?;
        let shards = (0..config.shards.max(1))
            .map(|_| Mutex::new(Shard::new(&template)))
            .collect();

        Ok(Self {
            config,
            template,
            shards,
            names: Admitted::new(),
            failure_groups: Admitted::new(),
            exception_messages: Admitted::new(),
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Fold one outcome into the statistics.
    pub fn record(&self, outcome: &RequestOutcome) {
        let key = self.admit(outcome);
        let failure = outcome.failure().map(|f| {
            let error = f.to_string();
            let exception = f.is_transport().then(|| self.admit_exception(error.clone()));
            (self.admit_failure(&key, error), exception)
        });

        let idx = (outcome.user_id as usize) % self.shards.len();
        let mut guard = self.shards[idx].lock();
        let shard = &mut *guard;
        shard.total.record(outcome);

        let template = &self.template;
        shard
            .requests
            .entry(key.clone())
            .or_insert_with(|| StatsEntry::new(template))
            .record(outcome);

        for tag in outcome.tags.iter() {
            if let Some(entry) = shard.tags.get_mut(tag) {
                entry.record(outcome);
            } else {
                let mut entry = StatsEntry::new(template);
                entry.record(outcome);
                shard.tags.insert(tag.clone(), entry);
            }
        }

        if let Some((failure_key, exception)) = failure {
            if let Some(message) = exception {
                let entry = shard.exceptions.entry(message).or_default();
                entry.count += 1;
                entry.names.insert(key.name);
            }
            *shard.failures.entry(failure_key).or_insert(0) += 1;
        }
    }

    /// Map an outcome to its stats key, folding new names into the overflow
    /// entry once the cardinality cap is reached.
    fn admit(&self, outcome: &RequestOutcome) -> StatKey {
        let key = StatKey {
            method: outcome.method.to_string(),
            name: outcome.name.clone(),
        };
        if self.names.keys.read().contains(&key) {
            return key;
        }

        match self.names.admit(&key, self.config.max_entries) {
            Admission::Tracked => key,
            Admission::Folded { first } => {
                if first {
                    warn!(
                        max_entries = self.config.max_entries,
                        name = %key.name,
                        "Request name cap reached, folding new names into {}", OVERFLOW_NAME
                    );
                }
                StatKey {
                    method: key.method,
                    name: OVERFLOW_NAME.to_string(),
                }
            }
        }
    }

    /// Failure group for an already admitted stats key. Past the cap, new
    /// groups collapse into one overflow row per method.
    fn admit_failure(&self, key: &StatKey, error: String) -> FailureKey {
        let group = FailureKey {
            method: key.method.clone(),
            name: key.name.clone(),
            error,
        };
        match self.failure_groups.admit(&group, self.config.max_entries) {
            Admission::Tracked => group,
            Admission::Folded { first } => {
                if first {
                    warn!(
                        max_entries = self.config.max_entries,
                        error = %group.error,
                        "Failure group cap reached, folding new groups into {}", OVERFLOW_NAME
                    );
                }
                FailureKey {
                    method: group.method,
                    name: OVERFLOW_NAME.to_string(),
                    error: OVERFLOW_NAME.to_string(),
                }
            }
        }
    }

    fn admit_exception(&self, message: String) -> String {
        match self.exception_messages.admit(&message, self.config.max_entries) {
            Admission::Tracked => message,
            Admission::Folded { first } => {
                if first {
                    warn!(
                        max_entries = self.config.max_entries,
                        error = %message,
                        "Exception cap reached, folding new messages into {}", OVERFLOW_NAME
                    );
                }
                OVERFLOW_NAME.to_string()
            }
        }
    }

    /// Drop everything recorded so far.
    pub fn reset(&self) {
        for shard in self.shards.iter() {
            *shard.lock() = Shard::new(&self.template);
        }
        self.names.clear();
        self.failure_groups.clear();
        self.exception_messages.clear();
    }

    /// Merge all shards into a summary. Each shard is locked only while it
    /// is copied out. Throughput is measured over the span of the recorded
    /// outcomes, so the result depends only on what was recorded.
    pub fn snapshot(&self) -> RunSummary {
        let mut total = StatsEntry::new(&self.template);
        let mut requests: BTreeMap<StatKey, StatsEntry> = BTreeMap::new();
        let mut tags: BTreeMap<String, StatsEntry> = BTreeMap::new();
        let mut failures: BTreeMap<FailureKey, u64> = BTreeMap::new();
        let mut exceptions: BTreeMap<String, ExceptionEntry> = BTreeMap::new();

        for shard in self.shards.iter() {
            let shard = shard.lock();
            total.merge(&shard.total);
            for (key, entry) in &shard.requests {
                requests
                    .entry(key.clone())
                    .or_insert_with(|| StatsEntry::new(&self.template))
                    .merge(entry);
            }
            for (tag, entry) in &shard.tags {
                tags.entry(tag.clone())
                    .or_insert_with(|| StatsEntry::new(&self.template))
                    .merge(entry);
            }
            for (key, count) in &shard.failures {
                *failures.entry(key.clone()).or_insert(0) += count;
            }
            for (message, entry) in &shard.exceptions {
                let merged = exceptions.entry(message.clone()).or_default();
                merged.count += entry.count;
                merged.names.extend(entry.names.iter().cloned());
            }
        }

        let span_secs = match (total.first_start, total.last_end) {
            (Some(start), Some(end)) => (end - start).num_microseconds().unwrap_or(0) as f64 / 1e6,
            _ => 0.0,
        };

        let total_row = total.row("", "Aggregated", span_secs);
        let error_rate = if total.requests > 0 {
            total.failures as f64 / total.requests as f64
        } else {
            0.0
        };

        RunSummary {
            started_at: total.first_start,
            last_activity: total.last_end,
            duration_secs: span_secs,
            error_rate,
            throughput: total_row.rps,
            p50_ms: total_row.median_ms,
            p95_ms: total_row.p95_ms,
            p99_ms: total_row.p99_ms,
            clamped_samples: total.clamped,
            overflowed_requests: self.names.overflowed(),
            overflowed_failures: self.failure_groups.overflowed() + self.exception_messages.overflowed(),
            requests: requests
                .iter()
                .map(|(key, entry)| entry.row(&key.method, &key.name, span_secs))
                .collect(),
            tags: tags
                .iter()
                .map(|(tag, entry)| entry.row("", tag, span_secs))
                .collect(),
            failures: failures
                .into_iter()
                .map(|(key, occurrences)| FailureRow {
                    method: key.method,
                    name: key.name,
                    error: key.error,
                    occurrences,
                })
                .collect(),
            exceptions: exceptions
                .into_iter()
                .map(|(message, entry)| ExceptionRow {
                    count: entry.count,
                    message,
                    names: entry.names.into_iter().collect(),
                })
                .collect(),
            total: total_row,
        }
    }
}

/// Derived statistics for one grouping. Latencies are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRow {
    pub method: String,
    pub name: String,
    pub requests: u64,
    pub failures: u64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_bytes: f64,
    pub total_bytes: u64,
    pub rps: f64,
    pub failures_per_sec: f64,
    /// Aligned with [`PERCENTILES`].
    pub percentiles_ms: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRow {
    pub method: String,
    pub name: String,
    pub error: String,
    pub occurrences: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRow {
    pub count: u64,
    pub message: String,
    pub names: Vec<String>,
}

/// Point-in-time view of the run's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    /// Failed share of all requests, 0.0-1.0.
    pub error_rate: f64,
    /// Requests per second over the recorded span.
    pub throughput: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Samples above the histogram ceiling, recorded at the ceiling.
    pub clamped_samples: u64,
    /// Requests folded into the overflow entry.
    pub overflowed_requests: u64,
    /// Failures and exceptions folded into their overflow rows.
    pub overflowed_failures: u64,
    pub total: StatsRow,
    pub requests: Vec<StatsRow>,
    pub tags: Vec<StatsRow>,
    pub failures: Vec<FailureRow>,
    pub exceptions: Vec<ExceptionRow>,
}

impl RunSummary {
    pub fn tag(&self, tag: &str) -> Option<&StatsRow> {
        self.tags.iter().find(|r| r.name == tag)
    }

    pub fn request(&self, method: &str, name: &str) -> Option<&StatsRow> {
        self.requests
            .iter()
            .find(|r| r.method == method && r.name == name)
    }
}
