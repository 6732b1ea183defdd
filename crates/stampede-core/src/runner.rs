//! Per-user action loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::aggregator::Aggregator;
use crate::credentials::Credentials;
use crate::error::LoadResult;
use crate::outcome::{FailureKind, OutcomeKind, RequestOutcome};
use crate::scenario::{ActionDefinition, RequestTemplate, ScenarioDefinition, Tags};
use crate::template::{MissingVariable, RenderContext};
use crate::think::ThinkTime;
use crate::transport::{join_url, PreparedRequest, Transport};

/// Control signal sent to every virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Running,
    /// Finish the in-flight request, then exit.
    Graceful,
    /// Abandon the in-flight request (recorded as cancelled) and exit.
    Hard,
}

impl StopMode {
    pub fn is_stopping(self) -> bool {
        self != StopMode::Running
    }
}

/// Everything the users of one run share.
pub struct RunContext {
    pub host: Url,
    pub transport: Arc<dyn Transport>,
    pub aggregator: Arc<Aggregator>,
    pub default_think_time: ThinkTime,
    headers: HeaderMap,
    tenant_id: String,
    request_seq: AtomicU64,
    cancelled: AtomicU64,
}

impl RunContext {
    pub fn new(
        host: Url,
        credentials: &Credentials,
        transport: Arc<dyn Transport>,
        aggregator: Arc<Aggregator>,
    ) -> LoadResult<Self> {
        Ok(Self {
            host,
            transport,
            aggregator,
            default_think_time: ThinkTime::default(),
            headers: credentials.headers()?,
            tenant_id: credentials.tenant_id.clone(),
            request_seq: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        })
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.default_think_time = think_time;
        self
    }

    /// Requests issued so far.
    pub fn requests_issued(&self) -> u64 {
        self.request_seq.load(Ordering::Relaxed)
    }

    /// Requests abandoned in flight by a hard stop.
    pub fn cancelled_requests(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn next_request_id(&self) -> u64 {
        self.request_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Counters a user reports when its loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserExit {
    pub user_id: u64,
    pub iterations: u64,
    pub requests: u64,
    pub cancelled: u64,
}

enum Flow {
    Continue,
    Stop,
}

/// Records a cancelled outcome if dropped before the request completes, so a
/// request abandoned by a hard stop (or an aborted task) is never lost.
struct InFlight<'a> {
    ctx: &'a RunContext,
    outcome: RequestOutcome,
    started: Instant,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(ctx: &'a RunContext, outcome: RequestOutcome) -> Self {
        Self {
            ctx,
            outcome,
            started: Instant::now(),
            armed: true,
        }
    }

    fn complete(mut self, kind: OutcomeKind, bytes: u64) -> RequestOutcome {
        self.armed = false;
        self.outcome.latency = self.started.elapsed();
        self.outcome.kind = kind;
        self.outcome.bytes = bytes;
        self.ctx.aggregator.record(&self.outcome);
        self.outcome.clone()
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.outcome.latency = self.started.elapsed();
            self.outcome.kind = OutcomeKind::Failure(FailureKind::Cancelled);
            self.ctx.cancelled.fetch_add(1, Ordering::Relaxed);
            self.ctx.aggregator.record(&self.outcome);
        }
    }
}

fn stopping(control: &watch::Receiver<StopMode>) -> bool {
    control.borrow().is_stopping()
}

/// Resolves once the control value satisfies `done`, or the sender is gone.
async fn signalled(control: &mut watch::Receiver<StopMode>, done: fn(StopMode) -> bool) {
    loop {
        if done(*control.borrow_and_update()) {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

/// One simulated client bound to a scenario.
pub struct VirtualUser {
    id: u64,
    scenario: Arc<ScenarioDefinition>,
    ctx: Arc<RunContext>,
    vars: HashMap<String, String>,
    rng: StdRng,
    exit: UserExit,
}

impl VirtualUser {
    pub fn new(id: u64, scenario: Arc<ScenarioDefinition>, ctx: Arc<RunContext>, rng: StdRng) -> Self {
        Self {
            id,
            scenario,
            ctx,
            vars: HashMap::new(),
            rng,
            exit: UserExit {
                user_id: id,
                ..UserExit::default()
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scenario(&self) -> &Arc<ScenarioDefinition> {
        &self.scenario
    }

    /// Run actions until told to stop. Failures never end the loop.
    pub async fn run(mut self, mut control: watch::Receiver<StopMode>) -> UserExit {
        let think = self
            .scenario
            .think_time
            .unwrap_or(self.ctx.default_think_time);
        debug!(user = self.id, scenario = %self.scenario.name, "Virtual user started");

        while !stopping(&control) {
            let started = Instant::now();
            let action = self.scenario.select_action(&mut self.rng).clone();
            self.exit.iterations += 1;

            if let Flow::Stop = self.run_action(&action, &mut control).await {
                break;
            }
            if stopping(&control) {
                break;
            }

            let delay = think.next_delay(&mut self.rng, started.elapsed());
            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = sleep(delay) => {}
                _ = signalled(&mut control, StopMode::is_stopping) => break,
            }
        }

        debug!(
            user = self.id,
            iterations = self.exit.iterations,
            requests = self.exit.requests,
            "Virtual user stopped"
        );
        self.exit
    }

    async fn run_action(
        &mut self,
        action: &ActionDefinition,
        control: &mut watch::Receiver<StopMode>,
    ) -> Flow {
        for (i, step) in action.steps.iter().enumerate() {
            // A stop requested mid-journey ends it before the next step.
            if i > 0 && stopping(control) {
                return Flow::Stop;
            }

            let request = match self.prepare(step) {
                Ok(request) => request,
                Err(MissingVariable(var)) => {
                    trace!(user = self.id, action = %action.name, var = %var, "Variable not captured yet, skipping action");
                    return Flow::Continue;
                }
            };

            match self.issue(step, &action.tags, request, control).await {
                Some(_) => {}
                None => return Flow::Stop,
            }
        }
        Flow::Continue
    }

    /// Render a step into a request. Errors here mean a referenced variable
    /// is missing; URL problems surface as failed outcomes in `issue`.
    fn prepare(&mut self, step: &RequestTemplate) -> Result<(String, Vec<(String, String)>, Option<Value>), MissingVariable> {
        let mut ctx = RenderContext {
            rng: &mut self.rng,
            vars: &self.vars,
            tenant: &self.ctx.tenant_id,
            today: Utc::now().date_naive(),
        };

        let path = step.path.render(&mut ctx)?;
        let mut query = Vec::with_capacity(step.query.len());
        for (key, value) in &step.query {
            query.push((key.clone(), value.render(&mut ctx)?));
        }
        let body = match &step.body {
            Some(body) => Some(body.render(&mut ctx)?),
            None => None,
        };
        Ok((path, query, body))
    }

    /// Send one request and record its outcome. Returns `None` when a hard
    /// stop abandoned it.
    async fn issue(
        &mut self,
        step: &RequestTemplate,
        tags: &Tags,
        (path, query, body): (String, Vec<(String, String)>, Option<Value>),
        control: &mut watch::Receiver<StopMode>,
    ) -> Option<RequestOutcome> {
        let ctx = self.ctx.clone();
        self.exit.requests += 1;
        let pending = self.pending_outcome(&ctx, &step.method, &step.name, tags, Utc::now());

        let url = match join_url(&ctx.host, &path) {
            Ok(url) => url,
            Err(e) => {
                let outcome = InFlight::new(&ctx, pending).complete(OutcomeKind::Failure(e.into()), 0);
                return Some(outcome);
            }
        };

        let request = PreparedRequest {
            method: step.method.clone(),
            url,
            query,
            headers: ctx.headers.clone(),
            body,
        };

        let in_flight = InFlight::new(&ctx, pending);
        let result = tokio::select! {
            biased;
            _ = signalled(control, |m| m == StopMode::Hard) => {
                drop(in_flight);
                self.exit.cancelled += 1;
                return None;
            }
            result = ctx.transport.send(request) => result,
        };

        let outcome = match result {
            Ok(response) => {
                let bytes = response.body.len() as u64;
                if step.is_accepted(response.status) {
                    self.capture(step, &response.body);
                    in_flight.complete(OutcomeKind::Success { status: response.status }, bytes)
                } else {
                    in_flight.complete(OutcomeKind::Failure(FailureKind::Status(response.status)), bytes)
                }
            }
            Err(e) => in_flight.complete(OutcomeKind::Failure(e.into()), 0),
        };

        trace!(
            user = self.id,
            request = outcome.request_id,
            name = %outcome.name,
            latency_ms = outcome.latency.as_millis() as u64,
            success = outcome.is_success(),
            "Request finished"
        );
        Some(outcome)
    }

    fn pending_outcome(
        &self,
        ctx: &RunContext,
        method: &Method,
        name: &str,
        tags: &Tags,
        started_at: DateTime<Utc>,
    ) -> RequestOutcome {
        RequestOutcome {
            request_id: ctx.next_request_id(),
            user_id: self.id,
            method: method.clone(),
            name: name.to_string(),
            tags: tags.clone(),
            started_at,
            latency: std::time::Duration::ZERO,
            bytes: 0,
            kind: OutcomeKind::Failure(FailureKind::Cancelled),
        }
    }

    /// Store declared JSON-pointer captures from a successful response.
    fn capture(&mut self, step: &RequestTemplate, body: &[u8]) {
        if step.captures.is_empty() {
            return;
        }
        let Ok(json) = serde_json::from_slice::<Value>(body) else {
            trace!(user = self.id, name = %step.name, "Response is not JSON, nothing to capture");
            return;
        };

        for (var, pointer) in &step.captures {
            let value = match json.pointer(pointer) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => continue,
            };
            trace!(user = self.id, var = %var, "Captured variable");
            self.vars.insert(var.clone(), value);
        }
    }

    /// Variables captured so far.
    pub fn variables(&self) -> &HashMap<String, String> {
        &self.vars
    }
}
