//! Virtual-user scheduler: linear ramp, ramp-down, graceful and hard stop.
//!
//! A supervisor task owns every user task (a [`JoinSet`]) and one `watch`
//! sender per user. The [`RunHandle`] talks to it over a command channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{LoadError, LoadResult};
use crate::registry::{ScenarioRegistry, TagFilter};
use crate::runner::{RunContext, StopMode, UserExit, VirtualUser};

const MIN_SPAWN_PERIOD: Duration = Duration::from_micros(100);
/// Slowest accepted ramp: one user per day.
const MAX_SPAWN_PERIOD: Duration = Duration::from_secs(86_400);

/// Target population and how fast to reach it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnPlan {
    pub users: usize,
    /// Users started per second.
    pub spawn_rate: f64,
    /// Graceful stop after this long; `None` runs until stopped.
    pub duration: Option<Duration>,
}

impl SpawnPlan {
    pub fn new(users: usize, spawn_rate: f64) -> Self {
        Self {
            users,
            spawn_rate,
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn validate(&self) -> LoadResult<()> {
        if self.users == 0 {
            return Err(LoadError::invalid_param("users", "must be at least 1"));
        }
        validate_rate(self.spawn_rate)?;
        if let Some(duration) = self.duration {
            if duration.is_zero() {
                return Err(LoadError::invalid_param("run_time", "must be greater than zero"));
            }
            if Instant::now().checked_add(duration).is_none() {
                return Err(LoadError::invalid_param(
                    "run_time",
                    format!("{}s is out of range", duration.as_secs()),
                ));
            }
        }
        Ok(())
    }
}

fn validate_rate(rate: f64) -> LoadResult<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(LoadError::invalid_param(
            "spawn_rate",
            format!("{} is not a positive number", rate),
        ));
    }
    match Duration::try_from_secs_f64(1.0 / rate) {
        Ok(period) if period <= MAX_SPAWN_PERIOD => Ok(()),
        _ => Err(LoadError::invalid_param(
            "spawn_rate",
            format!("{} is below one user per day", rate),
        )),
    }
}

fn spawn_period(rate: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / rate)
        .unwrap_or(MAX_SPAWN_PERIOD)
        .clamp(MIN_SPAWN_PERIOD, MAX_SPAWN_PERIOD)
}

/// Scheduler settings independent of the spawn plan.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a graceful stop may take before escalating to hard.
    pub stop_timeout: Duration,
    /// After a hard stop, how long before remaining user tasks are aborted.
    pub hard_stop_deadline: Duration,
    /// Seed for scenario and action selection.
    pub seed: Option<u64>,
    pub tag_filter: TagFilter,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            hard_stop_deadline: Duration::from_secs(5),
            seed: None,
            tag_filter: TagFilter::default(),
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    Stopped,
    Cancelled,
}

/// What happened while the run wound down.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReport {
    pub reason: StopReason,
    /// A graceful stop outlasted its timeout and became a hard stop.
    pub escalated: bool,
    pub users_spawned: u64,
    pub peak_users: usize,
    /// In-flight requests abandoned and recorded as cancelled.
    pub cancelled_requests: u64,
    /// User tasks that ignored the hard stop and were aborted.
    pub aborted_users: usize,
    pub iterations: u64,
    pub elapsed: Duration,
}

/// Live view of the population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStatus {
    pub active_users: usize,
    pub target_users: usize,
    pub users_spawned: u64,
    pub stopping: bool,
}

#[derive(Debug)]
enum Command {
    RampTo { users: usize, rate: f64 },
    Stop(StopMode),
}

/// Validated registry and shared context, ready to start runs.
pub struct Scheduler {
    registry: Arc<ScenarioRegistry>,
    ctx: Arc<RunContext>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Resolve the tag filter and check the registry can serve draws. Fails
    /// before any user exists.
    pub fn new(
        registry: &ScenarioRegistry,
        ctx: Arc<RunContext>,
        config: SchedulerConfig,
    ) -> LoadResult<Self> {
        let registry = registry.filter(&config.tag_filter)?;
        registry.ensure_selectable()?;
        if config.stop_timeout.is_zero() && config.hard_stop_deadline.is_zero() {
            warn!("Stop timeout and hard stop deadline are both zero, in-flight requests will be aborted");
        }

        Ok(Self {
            registry: Arc::new(registry),
            ctx,
            config,
        })
    }

    pub fn registry(&self) -> &ScenarioRegistry {
        &self.registry
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Start spawning users. Must be called within a tokio runtime.
    pub fn start(&self, plan: SpawnPlan) -> LoadResult<RunHandle> {
        plan.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(RunStatus {
            target_users: plan.users,
            ..RunStatus::default()
        });
        let gauge = Arc::new(AtomicUsize::new(0));
        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let supervisor = Supervisor {
            registry: self.registry.clone(),
            ctx: self.ctx.clone(),
            config: self.config.clone(),
            rng,
            users: JoinSet::new(),
            controls: BTreeMap::new(),
            retiring: Vec::new(),
            next_id: 0,
            target: plan.users,
            rate: plan.spawn_rate,
            spawned: 0,
            peak: 0,
            iterations: 0,
            stopping: false,
            gauge: gauge.clone(),
            status: status_tx,
        };
        let task = tokio::spawn(supervisor.run(plan, cmd_rx));

        Ok(RunHandle {
            commands: cmd_tx,
            status: status_rx,
            gauge,
            task,
        })
    }
}

/// Control surface of a running load test.
pub struct RunHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<RunStatus>,
    gauge: Arc<AtomicUsize>,
    task: JoinHandle<StopReport>,
}

impl RunHandle {
    pub fn active_users(&self) -> usize {
        self.gauge.load(Ordering::Relaxed)
    }

    /// Shared counter of active users, for samplers and progress displays.
    pub fn user_gauge(&self) -> Arc<AtomicUsize> {
        self.gauge.clone()
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// A cloneable handle that can stop the run from elsewhere (signal handlers).
    pub fn stopper(&self) -> Stopper {
        Stopper {
            commands: self.commands.clone(),
        }
    }

    /// Change the target population mid-run.
    pub async fn ramp_to(&self, users: usize, rate: f64) -> LoadResult<()> {
        validate_rate(rate)?;
        self.commands
            .send(Command::RampTo { users, rate })
            .await
            .map_err(|_| LoadError::Scheduler("run already finished".to_string()))
    }

    /// Resolves once the active population equals the target, or the run is
    /// stopping. Returns the status at that point.
    pub async fn ramp_complete(&self) -> RunStatus {
        let mut status = self.status.clone();
        loop {
            let current = *status.borrow_and_update();
            if current.stopping || current.active_users == current.target_users {
                return current;
            }
            if status.changed().await.is_err() {
                return *status.borrow();
            }
        }
    }

    /// Graceful stop; escalates to hard after the stop timeout.
    pub async fn stop(self) -> LoadResult<StopReport> {
        self.commands.send(Command::Stop(StopMode::Graceful)).await.ok();
        self.wait().await
    }

    /// Hard stop: abandon in-flight requests now.
    pub async fn cancel(self) -> LoadResult<StopReport> {
        self.commands.send(Command::Stop(StopMode::Hard)).await.ok();
        self.wait().await
    }

    /// Wait for the run to end on its own (duration elapsed or a stopper fired).
    pub async fn wait(self) -> LoadResult<StopReport> {
        self.task
            .await
            .map_err(|e| LoadError::Scheduler(e.to_string()))
    }
}

/// Stops a run without owning its [`RunHandle`].
#[derive(Debug, Clone)]
pub struct Stopper {
    commands: mpsc::Sender<Command>,
}

impl Stopper {
    pub async fn stop(&self) {
        self.commands.send(Command::Stop(StopMode::Graceful)).await.ok();
    }

    pub async fn cancel(&self) {
        self.commands.send(Command::Stop(StopMode::Hard)).await.ok();
    }
}

enum Drain {
    Finished,
    TimedOut,
    HardRequested,
}

struct Supervisor {
    registry: Arc<ScenarioRegistry>,
    ctx: Arc<RunContext>,
    config: SchedulerConfig,
    rng: StdRng,
    users: JoinSet<UserExit>,
    /// Running users by id; the last entry is the newest.
    controls: BTreeMap<u64, watch::Sender<StopMode>>,
    /// Users told to stop by a ramp-down that have not exited yet.
    retiring: Vec<watch::Sender<StopMode>>,
    next_id: u64,
    target: usize,
    rate: f64,
    spawned: u64,
    peak: usize,
    iterations: u64,
    stopping: bool,
    gauge: Arc<AtomicUsize>,
    status: watch::Sender<RunStatus>,
}

impl Supervisor {
    #[instrument(skip_all, fields(users = plan.users, spawn_rate = plan.spawn_rate))]
    async fn run(mut self, plan: SpawnPlan, mut commands: mpsc::Receiver<Command>) -> StopReport {
        let started = Instant::now();
        let cancelled_before = self.ctx.cancelled_requests();
        let deadline = plan.duration.and_then(|d| started.checked_add(d));
        let timer = sleep_until(deadline.unwrap_or(started));
        tokio::pin!(timer);
        let mut ticker = self.ticker(started);
        let mut ramp_logged = false;

        info!(
            scenarios = self.registry.len(),
            duration_secs = plan.duration.map(|d| d.as_secs_f64()),
            "Starting load test"
        );

        let (mode, reason) = loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::RampTo { users, rate }) => {
                        info!(from = self.target, to = users, rate, "Changing target population");
                        self.target = users;
                        self.rate = rate;
                        ticker = self.ticker(Instant::now());
                        ramp_logged = false;
                        self.publish();
                    }
                    Some(Command::Stop(StopMode::Hard)) => break (StopMode::Hard, StopReason::Cancelled),
                    Some(Command::Stop(_)) | None => break (StopMode::Graceful, StopReason::Stopped),
                },
                _ = &mut timer, if deadline.is_some() => {
                    info!("Run time elapsed, stopping");
                    break (StopMode::Graceful, StopReason::DurationElapsed);
                }
                _ = ticker.tick(), if self.controls.len() != self.target => {
                    if self.controls.len() < self.target {
                        self.spawn_user();
                    } else {
                        self.retire_newest();
                    }
                    if self.controls.len() == self.target && !ramp_logged {
                        ramp_logged = true;
                        info!(users = self.target, elapsed_secs = started.elapsed().as_secs_f64(), "All users spawned");
                    }
                    self.publish();
                }
                Some(result) = self.users.join_next(), if !self.users.is_empty() => {
                    self.on_exit(result);
                    self.publish();
                }
            }
        };

        let (escalated, aborted_users) = self.shutdown(mode, &mut commands).await;
        let report = StopReport {
            reason,
            escalated,
            users_spawned: self.spawned,
            peak_users: self.peak,
            cancelled_requests: self.ctx.cancelled_requests() - cancelled_before,
            aborted_users,
            iterations: self.iterations,
            elapsed: started.elapsed(),
        };
        info!(
            reason = ?report.reason,
            escalated = report.escalated,
            users_spawned = report.users_spawned,
            cancelled_requests = report.cancelled_requests,
            "Load test stopped"
        );
        report
    }

    /// Spawn/retire ticker; the first tick fires at `start`.
    fn ticker(&self, start: Instant) -> Interval {
        let mut ticker = interval_at(start, spawn_period(self.rate));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        ticker
    }

    fn spawn_user(&mut self) {
        let scenario = match self.registry.select_scenario(&mut self.rng) {
            Ok(scenario) => scenario,
            Err(e) => {
                error!(error = %e, "Failed to select a scenario");
                return;
            }
        };
        self.next_id += 1;
        let id = self.next_id;
        let (tx, rx) = watch::channel(StopMode::Running);
        let user = VirtualUser::new(
            id,
            scenario,
            self.ctx.clone(),
            StdRng::seed_from_u64(self.rng.gen()),
        );
        debug!(user = id, scenario = %user.scenario().name, "Spawning user");

        self.users.spawn(user.run(rx));
        self.controls.insert(id, tx);
        self.spawned += 1;
        self.peak = self.peak.max(self.controls.len());
    }

    fn retire_newest(&mut self) {
        if let Some((id, tx)) = self.controls.pop_last() {
            debug!(user = id, "Retiring user");
            tx.send_replace(StopMode::Graceful);
            self.retiring.push(tx);
        }
    }

    fn on_exit(&mut self, result: Result<UserExit, JoinError>) {
        match result {
            Ok(exit) => {
                self.iterations += exit.iterations;
                self.controls.remove(&exit.user_id);
            }
            Err(e) if e.is_panic() => error!(error = %e, "User task panicked"),
            Err(_) => {}
        }
        // A finished task dropped its receiver.
        self.controls.retain(|_, tx| !tx.is_closed());
        self.retiring.retain(|tx| !tx.is_closed());
    }

    fn publish(&self) {
        let active = if self.stopping {
            self.users.len()
        } else {
            self.controls.len()
        };
        self.gauge.store(active, Ordering::Relaxed);
        self.status.send_replace(RunStatus {
            active_users: active,
            target_users: self.target,
            users_spawned: self.spawned,
            stopping: self.stopping,
        });
    }

    fn signal_all(&self, mode: StopMode) {
        for tx in self.controls.values().chain(self.retiring.iter()) {
            tx.send_replace(mode);
        }
    }

    /// Stop every user. Returns whether a graceful stop escalated, and how
    /// many tasks had to be aborted.
    async fn shutdown(
        &mut self,
        mode: StopMode,
        commands: &mut mpsc::Receiver<Command>,
    ) -> (bool, usize) {
        self.stopping = true;
        self.target = 0;
        self.publish();
        info!(users = self.users.len(), mode = ?mode, "Stopping users");

        let mut escalated = false;
        if mode == StopMode::Graceful {
            self.signal_all(StopMode::Graceful);
            let deadline = Instant::now() + self.config.stop_timeout;
            match self.drain(deadline, Some(commands)).await {
                Drain::Finished => return (false, 0),
                Drain::TimedOut => {
                    warn!(
                        remaining = self.users.len(),
                        timeout_secs = self.config.stop_timeout.as_secs_f64(),
                        "Graceful stop timed out, cancelling in-flight requests"
                    );
                    escalated = true;
                }
                Drain::HardRequested => info!("Hard stop requested during graceful stop"),
            }
        }

        self.signal_all(StopMode::Hard);
        let deadline = Instant::now() + self.config.hard_stop_deadline;
        if let Drain::Finished = self.drain(deadline, None).await {
            return (escalated, 0);
        }

        let aborted = self.users.len();
        warn!(users = aborted, "Aborting users that did not stop");
        self.users.abort_all();
        while let Some(result) = self.users.join_next().await {
            self.on_exit(result);
        }
        self.publish();
        (escalated, aborted)
    }

    async fn drain(
        &mut self,
        deadline: Instant,
        mut commands: Option<&mut mpsc::Receiver<Command>>,
    ) -> Drain {
        let timer = sleep_until(deadline);
        tokio::pin!(timer);

        loop {
            if self.users.is_empty() {
                self.publish();
                return Drain::Finished;
            }
            let listening = commands.is_some();
            tokio::select! {
                biased;
                Some(command) = recv(&mut commands), if listening => {
                    if let Command::Stop(StopMode::Hard) = command {
                        return Drain::HardRequested;
                    }
                }
                Some(result) = self.users.join_next() => {
                    self.on_exit(result);
                    self.publish();
                }
                _ = &mut timer => return Drain::TimedOut,
            }
        }
    }
}

async fn recv(commands: &mut Option<&mut mpsc::Receiver<Command>>) -> Option<Command> {
    match commands {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_validation() {
        assert!(SpawnPlan::new(10, 2.0).validate().is_ok());
        assert!(SpawnPlan::new(0, 2.0).validate().is_err());
        assert!(SpawnPlan::new(10, 0.0).validate().is_err());
        assert!(SpawnPlan::new(10, f64::NAN).validate().is_err());
        assert!(SpawnPlan::new(10, 1.0)
            .with_duration(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_spawn_period() {
        assert_eq!(spawn_period(10.0), Duration::from_millis(100));
        assert_eq!(spawn_period(0.5), Duration::from_secs(2));
        assert_eq!(spawn_period(1e12), MIN_SPAWN_PERIOD);
        assert_eq!(spawn_period(1e-20), MAX_SPAWN_PERIOD);
    }

    #[test]
    fn test_rejects_out_of_range_plans() {
        assert!(SpawnPlan::new(10, 1e-20).validate().is_err());
        assert!(SpawnPlan::new(10, 1.0 / 90_000.0).validate().is_err());
        assert!(SpawnPlan::new(10, 1.0 / 3_600.0).validate().is_ok());
        assert!(SpawnPlan::new(10, 1.0)
            .with_duration(Duration::from_secs(u64::MAX))
            .validate()
            .is_err());
    }
}
