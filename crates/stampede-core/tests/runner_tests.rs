//! Action runner tests against the scripted transport.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use stampede_core::{
    ActionDefinition, FailureKind, RequestTemplate, ScenarioDefinition, StopMode, ThinkTime,
    TransportError, VirtualUser,
};
use test_utils::{context, MockTransport};
use tokio::sync::watch;
use tokio::time::sleep;

fn single(name: &str, steps: Vec<RequestTemplate>) -> Arc<ScenarioDefinition> {
    let action = ActionDefinition::new(name, 1.0, &["p1"], steps);
    Arc::new(ScenarioDefinition::new(name, 1.0, vec![action]).unwrap())
}

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failures_never_stop_the_loop() {
    let transport = Arc::new(
        MockTransport::new()
            .route("/api/broken/", 500, json!({"detail": "boom"}))
            .route_error("/api/down/", TransportError::ConnectionRefused("os error 111".into()))
            .route_error("/api/slow/", TransportError::Timeout),
    );
    let ctx = context(transport.clone(), ThinkTime::constant(1.0));
    let actions = vec![
        ActionDefinition::new("ok", 1.0, &["p0"], vec![RequestTemplate::get("/api/ok/").unwrap()]),
        ActionDefinition::new("broken", 1.0, &["p1"], vec![RequestTemplate::get("/api/broken/").unwrap()]),
        ActionDefinition::new("down", 1.0, &["p1"], vec![RequestTemplate::get("/api/down/").unwrap()]),
        ActionDefinition::new("slow", 1.0, &["p2"], vec![RequestTemplate::get("/api/slow/").unwrap()]),
    ];
    let scenario = Arc::new(ScenarioDefinition::new("mixed", 1.0, actions).unwrap());

    let (tx, rx) = watch::channel(StopMode::Running);
    let user = VirtualUser::new(1, scenario, ctx.clone(), StdRng::seed_from_u64(3));
    let task = tokio::spawn(user.run(rx));

    sleep(Duration::from_millis(39_500)).await;
    tx.send_replace(StopMode::Graceful);
    let exit = task.await.unwrap();
    assert_eq!(exit.requests, 40);
    assert_eq!(exit.iterations, 40);
    assert_eq!(exit.cancelled, 0);

    let summary = ctx.aggregator.snapshot();
    assert_eq!(summary.total.requests, 40);
    let ok = summary.request("GET", "/api/ok/").map_or(0, |r| r.requests);
    assert!(ok > 0);
    assert_eq!(summary.total.failures, 40 - ok);

    // One category per outcome: each failure lands in exactly one group.
    let grouped: u64 = summary.failures.iter().map(|f| f.occurrences).sum();
    assert_eq!(grouped, summary.total.failures);
    let errors: Vec<&str> = summary.failures.iter().map(|f| f.error.as_str()).collect();
    assert!(errors.contains(&"HTTP 500: Unexpected status"));
    assert!(errors.contains(&"Request timeout"));
    assert!(errors.iter().any(|e| e.starts_with("Connection refused")));

    // Only the transport-level failures are exceptions.
    let exceptions: u64 = summary.exceptions.iter().map(|e| e.count).sum();
    let http_failures = summary
        .failures
        .iter()
        .filter(|f| f.error.starts_with("HTTP"))
        .map(|f| f.occurrences)
        .sum::<u64>();
    assert_eq!(exceptions, summary.total.failures - http_failures);
}

#[tokio::test(start_paused = true)]
async fn test_expected_status_list() {
    let transport = Arc::new(MockTransport::new().with_status(404));
    let ctx = context(transport.clone(), ThinkTime::constant(1.0));
    let mut step = RequestTemplate::get("/api/missing/").unwrap();
    step.expect_status = vec![404];
    let scenario = single("lookup", vec![step]);

    let (tx, rx) = watch::channel(StopMode::Running);
    let task = tokio::spawn(VirtualUser::new(1, scenario, ctx.clone(), StdRng::seed_from_u64(1)).run(rx));
    sleep(Duration::from_millis(2_500)).await;
    tx.send_replace(StopMode::Graceful);
    task.await.unwrap();

    let summary = ctx.aggregator.snapshot();
    assert_eq!(summary.total.requests, 3);
    assert_eq!(summary.total.failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_outcomes_carry_action_tags() {
    let transport = Arc::new(MockTransport::new());
    let ctx = context(transport, ThinkTime::constant(1.0));
    let scenario = single("dashboard", vec![RequestTemplate::get("/api/agents/").unwrap()]);

    let (tx, rx) = watch::channel(StopMode::Running);
    let task = tokio::spawn(VirtualUser::new(1, scenario, ctx.clone(), StdRng::seed_from_u64(1)).run(rx));
    sleep(Duration::from_millis(1_500)).await;
    tx.send_replace(StopMode::Graceful);
    task.await.unwrap();

    let summary = ctx.aggregator.snapshot();
    assert_eq!(summary.tag("p1").map(|r| r.requests), Some(2));
}

// ============================================================================
// Templates and captures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_capture_feeds_later_steps() {
    let transport = Arc::new(
        MockTransport::new().route("/api/ai/conversations/", 201, json!({"id": "conv-1"})),
    );
    let ctx = context(transport.clone(), ThinkTime::constant(1.0));
    let create = RequestTemplate::post("/api/ai/conversations/", json!({"title": "Load test {uuid}"}))
        .unwrap()
        .capture("conversation", "/id");
    let message = RequestTemplate::post(
        "/api/ai/conversations/{var:conversation}/messages/",
        json!({"content": "{choice:Show my top agents|Summarize payouts}"}),
    )
    .unwrap()
    .named("/api/ai/conversations/[id]/messages/");
    let scenario = single("ai", vec![create, message]);

    let (tx, rx) = watch::channel(StopMode::Running);
    let user = VirtualUser::new(1, scenario, ctx.clone(), StdRng::seed_from_u64(1));
    let task = tokio::spawn(user.run(rx));
    sleep(Duration::from_millis(500)).await;
    tx.send_replace(StopMode::Graceful);
    task.await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].url.path(), "/api/ai/conversations/conv-1/messages/");
    let content = requests[1].body.as_ref().unwrap()["content"].as_str().unwrap();
    assert!(content == "Show my top agents" || content == "Summarize payouts");
    let title = requests[0].body.as_ref().unwrap()["title"].as_str().unwrap();
    assert!(title.starts_with("Load test ") && title.len() == "Load test ".len() + 36);

    let summary = ctx.aggregator.snapshot();
    assert!(summary
        .request("POST", "/api/ai/conversations/[id]/messages/")
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn test_missing_variable_skips_action() {
    let transport = Arc::new(MockTransport::new());
    let ctx = context(transport.clone(), ThinkTime::constant(1.0));
    let scenario = single(
        "orphan",
        vec![RequestTemplate::get("/api/deals/{var:deal}/").unwrap()],
    );

    let (tx, rx) = watch::channel(StopMode::Running);
    let task = tokio::spawn(VirtualUser::new(1, scenario, ctx.clone(), StdRng::seed_from_u64(1)).run(rx));
    sleep(Duration::from_millis(3_500)).await;
    tx.send_replace(StopMode::Graceful);
    let exit = task.await.unwrap();

    assert_eq!(transport.sent(), 0);
    assert_eq!(exit.requests, 0);
    assert_eq!(exit.iterations, 4);
    assert_eq!(ctx.aggregator.snapshot().total.requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_credentials_and_query_are_sent() {
    let transport = Arc::new(MockTransport::new());
    let ctx = context(transport.clone(), ThinkTime::constant(1.0));
    let mut step = RequestTemplate::get("/api/sms/messages/").unwrap();
    step.query = vec![(
        "page".to_string(),
        stampede_core::template::Template::parse("{int:1-3}").unwrap(),
    )];
    let scenario = single("sms", vec![step]);

    let (tx, rx) = watch::channel(StopMode::Running);
    let task = tokio::spawn(VirtualUser::new(1, scenario, ctx, StdRng::seed_from_u64(1)).run(rx));
    sleep(Duration::from_millis(100)).await;
    tx.send_replace(StopMode::Graceful);
    task.await.unwrap();

    let request = &transport.requests()[0];
    assert_eq!(request.headers["authorization"], "Bearer test-token");
    assert_eq!(request.headers["x-agency-id"], "agency-1");
    assert_eq!(request.headers["content-type"], "application/json");
    let page: u32 = request.query[0].1.parse().unwrap();
    assert!((1..=3).contains(&page));
}

// ============================================================================
// Think time and stop signals
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_constant_pacing_absorbs_latency() {
    let transport = Arc::new(MockTransport::new().with_latency(Duration::from_millis(400)));
    let ctx = context(transport.clone(), ThinkTime::constant(1.0));
    let scenario = Arc::new(
        ScenarioDefinition::new(
            "paced",
            1.0,
            vec![ActionDefinition::new("a", 1.0, &[], vec![RequestTemplate::get("/api/a/").unwrap()])],
        )
        .unwrap()
        .with_think_time(ThinkTime::ConstantPacing { secs: 1.0 }),
    );

    let (tx, rx) = watch::channel(StopMode::Running);
    let task = tokio::spawn(VirtualUser::new(1, scenario, ctx, StdRng::seed_from_u64(1)).run(rx));
    // Iterations start at 0, 1, 2, ... regardless of the 400 ms latency.
    sleep(Duration::from_millis(4_500)).await;
    tx.send_replace(StopMode::Graceful);
    let exit = task.await.unwrap();
    assert_eq!(exit.requests, 5);
}

#[tokio::test(start_paused = true)]
async fn test_hard_stop_cancels_in_flight_request() {
    let transport = Arc::new(MockTransport::new().with_latency(Duration::from_secs(10)));
    let ctx = context(transport.clone(), ThinkTime::constant(1.0));
    let scenario = single("slow", vec![RequestTemplate::get("/api/slow/").unwrap()]);

    let (tx, rx) = watch::channel(StopMode::Running);
    let task = tokio::spawn(VirtualUser::new(9, scenario, ctx.clone(), StdRng::seed_from_u64(1)).run(rx));
    sleep(Duration::from_secs(2)).await;
    tx.send_replace(StopMode::Hard);
    let exit = task.await.unwrap();

    assert_eq!(exit.cancelled, 1);
    assert_eq!(ctx.cancelled_requests(), 1);
    assert_eq!(transport.completed(), 0);
    let summary = ctx.aggregator.snapshot();
    assert_eq!(summary.total.failures, 1);
    assert_eq!(summary.failures[0].error, FailureKind::Cancelled.to_string());
    // Latency covers the time spent in flight.
    assert!(summary.total.max_ms >= 1_900.0);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_user_records_cancelled() {
    let transport = Arc::new(MockTransport::new().with_latency(Duration::from_secs(10)));
    let ctx = context(transport.clone(), ThinkTime::constant(1.0));
    let scenario = single("slow", vec![RequestTemplate::get("/api/slow/").unwrap()]);

    let (_tx, rx) = watch::channel(StopMode::Running);
    let task = tokio::spawn(VirtualUser::new(1, scenario, ctx.clone(), StdRng::seed_from_u64(1)).run(rx));
    sleep(Duration::from_secs(1)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(ctx.cancelled_requests(), 1);
    assert_eq!(ctx.aggregator.snapshot().total.requests, 1);
}
