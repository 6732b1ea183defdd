//! Time-bucketed history of the run, sampled from the aggregator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::aggregator::{Aggregator, RunSummary};

/// One sample of the run: current rates over the last bucket plus the
/// cumulative statistics at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub timestamp: DateTime<Utc>,
    pub user_count: usize,
    /// Requests per second since the previous sample.
    pub current_rps: f64,
    /// Failures per second since the previous sample.
    pub current_failures_per_sec: f64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub median_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_bytes: f64,
    /// Cumulative percentiles, aligned with `aggregator::PERCENTILES`.
    pub percentiles_ms: Vec<f64>,
}

/// Bounded series of history rows; the oldest rows drop first.
#[derive(Debug, Clone)]
pub struct History {
    rows: VecDeque<HistoryRow>,
    limit: usize,
    dropped: u64,
    last: Option<(Instant, u64, u64)>,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            rows: VecDeque::new(),
            limit: limit.max(1),
            dropped: 0,
            last: None,
        }
    }

    /// Append a sample taken at `at` (monotonic) / `timestamp` (wall clock).
    pub fn push(
        &mut self,
        summary: &RunSummary,
        user_count: usize,
        at: Instant,
        timestamp: DateTime<Utc>,
    ) -> &HistoryRow {
        let requests = summary.total.requests;
        let failures = summary.total.failures;
        let (current_rps, current_failures_per_sec) = match self.last {
            Some((prev_at, prev_requests, prev_failures)) => {
                let secs = at.duration_since(prev_at).as_secs_f64();
                if secs > 0.0 {
                    (
                        requests.saturating_sub(prev_requests) as f64 / secs,
                        failures.saturating_sub(prev_failures) as f64 / secs,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };
        self.last = Some((at, requests, failures));

        if self.rows.len() == self.limit {
            self.rows.pop_front();
            self.dropped += 1;
        }
        self.rows.push_back(HistoryRow {
            timestamp,
            user_count,
            current_rps,
            current_failures_per_sec,
            total_requests: requests,
            total_failures: failures,
            median_ms: summary.total.median_ms,
            avg_ms: summary.total.avg_ms,
            min_ms: summary.total.min_ms,
            max_ms: summary.total.max_ms,
            avg_bytes: summary.total.avg_bytes,
            percentiles_ms: summary.total.percentiles_ms.clone(),
        });
        // Just pushed, so the deque is non-empty.
        &self.rows[self.rows.len() - 1]
    }

    pub fn rows(&self) -> impl Iterator<Item = &HistoryRow> {
        self.rows.iter()
    }

    pub fn latest(&self) -> Option<&HistoryRow> {
        self.rows.back()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows evicted because the limit was reached.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Background task sampling the aggregator at a fixed interval.
pub struct HistorySampler {
    history: Arc<Mutex<History>>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HistorySampler {
    /// Start sampling. With `log_live` each sample is also logged.
    pub fn spawn(
        aggregator: Arc<Aggregator>,
        users: Arc<AtomicUsize>,
        every: Duration,
        limit: usize,
        log_live: bool,
    ) -> Self {
        let history = Arc::new(Mutex::new(History::new(limit)));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = history.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first row
            // covers a full bucket.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }

                let summary = aggregator.snapshot();
                let user_count = users.load(Ordering::Relaxed);
                let mut history = shared.lock();
                let row = history.push(&summary, user_count, Instant::now(), Utc::now());
                if log_live {
                    info!(
                        users = row.user_count,
                        rps = row.current_rps,
                        fails_per_sec = row.current_failures_per_sec,
                        requests = row.total_requests,
                        failures = row.total_failures,
                        p50_ms = row.median_ms,
                        p95_ms = summary.p95_ms,
                        "Live stats"
                    );
                }
            }
            debug!("History sampler stopped");
        });

        Self {
            history,
            stop_tx,
            handle,
        }
    }

    /// Shared view of the history collected so far.
    pub fn history(&self) -> Arc<Mutex<History>> {
        self.history.clone()
    }

    /// Take one final sample, stop the task, and return the history.
    pub async fn finish(self, aggregator: &Aggregator, users: usize) -> History {
        self.stop_tx.send(true).ok();
        self.handle.await.ok();

        let mut history = self.history.lock().clone();
        history.push(&aggregator.snapshot(), users, Instant::now(), Utc::now());
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatorConfig;
    use crate::outcome::{OutcomeKind, RequestOutcome};
    use reqwest::Method;

    fn record(aggregator: &Aggregator, n: u64) {
        for i in 0..n {
            aggregator.record(&RequestOutcome {
                request_id: i,
                user_id: i,
                method: Method::GET,
                name: "/a".to_string(),
                tags: Vec::<String>::new().into(),
                started_at: Utc::now(),
                latency: Duration::from_millis(5),
                bytes: 10,
                kind: OutcomeKind::Success { status: 200 },
            });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_rate_uses_bucket_delta() {
        let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();
        let mut history = History::new(10);
        let t0 = Instant::now();

        record(&aggregator, 10);
        history.push(&aggregator.snapshot(), 1, t0, Utc::now());
        record(&aggregator, 20);
        let row = history
            .push(&aggregator.snapshot(), 2, t0 + Duration::from_secs(2), Utc::now())
            .clone();

        assert_eq!(row.total_requests, 30);
        assert!((row.current_rps - 10.0).abs() < 1e-9);
        assert_eq!(row.user_count, 2);
    }

    #[test]
    fn test_limit_drops_oldest() {
        let aggregator = Aggregator::new(AggregatorConfig::default()).unwrap();
        let summary = aggregator.snapshot();
        let mut history = History::new(2);
        let t0 = Instant::now();
        for i in 0..5 {
            history.push(&summary, i, t0 + Duration::from_secs(i as u64), Utc::now());
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.dropped(), 3);
        assert_eq!(history.latest().unwrap().user_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_collects_rows() {
        let aggregator = Arc::new(Aggregator::new(AggregatorConfig::default()).unwrap());
        let users = Arc::new(AtomicUsize::new(3));
        let sampler = HistorySampler::spawn(aggregator.clone(), users, Duration::from_secs(1), 100, false);

        record(&aggregator, 5);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let history = sampler.finish(&aggregator, 0).await;

        // Three interval samples plus the final one.
        assert_eq!(history.len(), 4);
        assert_eq!(history.rows().next().unwrap().user_count, 3);
        assert_eq!(history.latest().unwrap().user_count, 0);
        assert_eq!(history.latest().unwrap().total_requests, 5);
    }
}
