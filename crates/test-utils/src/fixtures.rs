//! Common fixtures for stampede tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use stampede_core::transport::parse_host;
use stampede_core::{
    ActionDefinition, Aggregator, AggregatorConfig, Credentials, OutcomeKind, RequestOutcome,
    RequestTemplate, RunContext, ScenarioDefinition, ScenarioRegistry, ThinkTime, Transport,
};

/// Host used with [`crate::MockTransport`]; never resolved.
pub const MOCK_HOST: &str = "http://target.test";

/// A fixed wall-clock instant for deterministic outcomes.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Single-action scenario issuing `GET /api/<name>/`.
pub fn scenario(name: &str, weight: f64, tags: &[&str]) -> ScenarioDefinition {
    let path = format!("/api/{}/", name);
    let action = ActionDefinition::new(
        format!("{}_action", name),
        1.0,
        tags,
        vec![RequestTemplate::get(&path).expect("static path")],
    );
    ScenarioDefinition::new(name, weight, vec![action]).expect("valid scenario")
}

/// Registry of single-action scenarios with the given weights.
pub fn registry(weights: &[(&str, f64)]) -> ScenarioRegistry {
    ScenarioRegistry::from_definitions(weights.iter().map(|(n, w)| scenario(n, *w, &[])))
        .expect("unique names")
}

pub fn aggregator() -> Arc<Aggregator> {
    Arc::new(Aggregator::new(AggregatorConfig::default()).expect("default config"))
}

/// Run context against [`MOCK_HOST`] with a fixed tenant.
pub fn context(transport: Arc<dyn Transport>, think_time: ThinkTime) -> Arc<RunContext> {
    context_for(MOCK_HOST, transport, think_time)
}

pub fn context_for(host: &str, transport: Arc<dyn Transport>, think_time: ThinkTime) -> Arc<RunContext> {
    let host = parse_host(host).expect("valid host");
    let ctx = RunContext::new(
        host,
        &Credentials::new("test-token", "agency-1"),
        transport,
        aggregator(),
    )
    .expect("valid credentials")
    .with_think_time(think_time);
    Arc::new(ctx)
}

/// An outcome of `GET <name>` started at [`epoch`] plus `offset_ms`.
pub fn outcome(user_id: u64, name: &str, offset_ms: i64, latency_ms: u64, kind: OutcomeKind) -> RequestOutcome {
    RequestOutcome {
        request_id: 0,
        user_id,
        method: Method::GET,
        name: name.to_string(),
        tags: Vec::<String>::new().into(),
        started_at: epoch() + chrono::Duration::milliseconds(offset_ms),
        latency: Duration::from_millis(latency_ms),
        bytes: 64,
        kind,
    }
}

pub fn ok() -> OutcomeKind {
    OutcomeKind::Success { status: 200 }
}
