//! Interactive progress bar for runs that are not headless.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use stampede_core::Aggregator;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

const REFRESH: Duration = Duration::from_millis(500);

/// Progress bar refreshed from the aggregator and the user gauge.
pub struct RunProgress {
    bar: ProgressBar,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunProgress {
    /// A bar over `run_time` seconds, or a spinner for open-ended runs.
    pub fn start(
        aggregator: Arc<Aggregator>,
        users: Arc<AtomicUsize>,
        run_time: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let bar = match run_time {
            Some(run_time) => {
                let bar = ProgressBar::new(run_time.as_secs().max(1));
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len}s {msg}")?
                        .progress_chars("##-"),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(ProgressStyle::default_spinner().template("[{elapsed_precise}] {spinner} {msg}")?);
                bar
            }
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = bar.clone();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = interval(REFRESH);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                let summary = aggregator.snapshot();
                if run_time.is_some() {
                    shared.set_position(started.elapsed().as_secs());
                } else {
                    shared.tick();
                }
                shared.set_message(format!(
                    "users: {} | {:.1} req/s | fails: {} ({:.1}%)",
                    users.load(Ordering::Relaxed),
                    summary.throughput,
                    summary.total.failures,
                    summary.error_rate * 100.0
                ));
            }
        });

        Ok(Self {
            bar,
            stop_tx,
            handle,
        })
    }

    pub async fn finish(self) {
        self.stop_tx.send(true).ok();
        self.handle.await.ok();
        self.bar.finish_with_message("Complete!");
    }
}
