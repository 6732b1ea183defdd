//! Live run metrics for Prometheus.
//!
//! The exporter serves the latest aggregator snapshot, republished at a fixed
//! interval: cumulative counters as absolute values, rates and percentiles as
//! gauges.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use stampede_core::{Aggregator, RunSummary};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Install the global recorder and its HTTP listener.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

/// Push one snapshot into the installed recorder.
pub fn publish(summary: &RunSummary, users: usize) {
    gauge!("stampede_users").set(users as f64);
    gauge!("stampede_throughput_rps").set(summary.throughput);
    gauge!("stampede_error_rate").set(summary.error_rate);
    gauge!("stampede_latency_p50_ms").set(summary.p50_ms);
    gauge!("stampede_latency_p95_ms").set(summary.p95_ms);
    gauge!("stampede_latency_p99_ms").set(summary.p99_ms);
    counter!("stampede_clamped_samples_total").absolute(summary.clamped_samples);

    for row in &summary.requests {
        let labels = [("method", row.method.clone()), ("name", row.name.clone())];
        counter!("stampede_requests_total", &labels).absolute(row.requests);
        counter!("stampede_failures_total", &labels).absolute(row.failures);
        gauge!("stampede_request_p95_ms", &labels).set(row.p95_ms);
    }
    for row in &summary.tags {
        let labels = [("tag", row.name.clone())];
        counter!("stampede_tag_requests_total", &labels).absolute(row.requests);
        counter!("stampede_tag_failures_total", &labels).absolute(row.failures);
    }
}

/// Background task republishing the aggregator every second.
pub struct MetricsPublisher {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MetricsPublisher {
    pub fn spawn(aggregator: Arc<Aggregator>, users: Arc<AtomicUsize>) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(PUBLISH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                publish(&aggregator.snapshot(), users.load(Ordering::Relaxed));
            }
            // Final totals stay visible until the process exits.
            publish(&aggregator.snapshot(), 0);
        });
        Self { stop_tx, handle }
    }

    pub async fn finish(self) {
        self.stop_tx.send(true).ok();
        self.handle.await.ok();
    }
}
