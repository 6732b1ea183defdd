//! Full runs through the service layer: configuration, orchestration,
//! threshold gate and exports.

use std::path::PathBuf;
use std::sync::Arc;

use stampede::app::quick_test_with;
use stampede::{
    evaluate, list_scenarios, quick_test, run_load_test, run_with_transport, LoadedScenario,
    QuickArgs, RunArgs, RunConfig, Thresholds,
};
use stampede_core::registry::TagFilter;
use stampede_core::{StopReason, TransportError};
use test_utils::{MockTransport, TargetServer, MOCK_HOST};

const CATALOG: &str = r#"
name: smoke
think_time: { type: constant, secs: 0.05 }
scenarios:
  - name: Browser
    weight: 1
    actions:
      - name: ok
        weight: 3
        tags: [p0]
        steps:
          - path: /api/ok
      - name: broken
        weight: 1
        tags: [p2]
        steps:
          - path: /api/fail
"#;

fn scenarios_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios")
}

fn run_args(host: &str) -> RunArgs {
    RunArgs {
        host: Some(host.to_string()),
        users: Some(4),
        spawn_rate: Some(20.0),
        run_time: Some("1s".to_string()),
        headless: true,
        seed: Some(11),
        auth_token: "secret".to_string(),
        agency_id: Some("agency-9".to_string()),
        tenant_header: "X-Agency-Id".to_string(),
        ..RunArgs::default()
    }
}

// ============================================================================
// Bundled catalog
// ============================================================================

#[test]
fn test_bundled_catalog_compiles() {
    let loaded = LoadedScenario::from_file(scenarios_dir().join("agentspace.yaml")).unwrap();
    let registry = loaded.registry().unwrap();

    assert_eq!(registry.len(), 12);
    assert_eq!(registry.total_weight(), 28.0);
    assert_eq!(registry.get("DashboardUser").map(|s| s.weight), Some(10.0));
    assert_eq!(registry.get("DashboardUser").map(|s| s.actions().len()), Some(8));
    assert_eq!(registry.get("SpikeTestUser").map(|s| s.weight), Some(0.0));
    assert_eq!(loaded.run.users, Some(50));
    assert_eq!(loaded.run.thresholds.max_error_rate, Some(0.01));
}

#[test]
fn test_bundled_catalog_tag_selection() {
    let loaded = LoadedScenario::from_file(scenarios_dir().join("agentspace.yaml")).unwrap();
    let registry = loaded.registry().unwrap();

    let spike = registry
        .filter(&TagFilter::new(["spike"], Vec::<String>::new()))
        .unwrap();
    assert_eq!(spike.len(), 1);
    assert_eq!(spike.scenarios()[0].name, "SpikeTestUser");

    let journeys = registry
        .filter(&TagFilter::new(["journey"], Vec::<String>::new()))
        .unwrap();
    assert_eq!(journeys.len(), 1);
    assert_eq!(journeys.scenarios()[0].actions().len(), 3);

    // Excluding writes keeps every positive-weight archetype except the admin.
    let reads = registry
        .filter(&TagFilter::new(Vec::<String>::new(), ["write"]))
        .unwrap();
    assert!(reads.get("AdminWriteUser").is_none());
    assert_eq!(reads.total_weight(), 27.0);
}

#[test]
fn test_list_scenarios() {
    let listings = list_scenarios(&scenarios_dir()).unwrap();
    let agentspace = listings
        .iter()
        .find(|l| l.file_name == "agentspace.yaml")
        .unwrap();
    assert_eq!(agentspace.name, "agentspace");
    assert_eq!(agentspace.scenarios.len(), 12);

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("good.yaml"), CATALOG).unwrap();
    std::fs::write(dir.path().join("bad.yaml"), "scenarios: [").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
    let listings = list_scenarios(dir.path()).unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].file_name, "good.yaml");
    assert_eq!(listings[0].scenarios[0].0, "Browser");

    assert!(list_scenarios(&dir.path().join("missing")).is_err());
}

// ============================================================================
// Runs with a scripted transport
// ============================================================================

#[tokio::test]
async fn test_run_applies_threshold_gate() {
    let loaded = LoadedScenario::from_yaml(CATALOG).unwrap();
    let registry = loaded.registry().unwrap();
    let transport = MockTransport::new().route("/api/fail", 503, serde_json::json!({}));

    let mut args = run_args(MOCK_HOST);
    args.max_error_rate = Some(1.0);
    let config = RunConfig::resolve(&loaded.run, &args).unwrap();

    let outcome = run_with_transport(&registry, &config, Arc::new(transport.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.stop.reason, StopReason::DurationElapsed);
    assert_eq!(outcome.stop.peak_users, 4);
    assert_eq!(outcome.summary.total.requests, transport.sent());
    assert!(outcome.summary.total.failures > 0);
    assert!(outcome.verdict.passed);
    assert!(!outcome.history.is_empty());
    assert!(outcome.csv_files.is_empty());

    // The same run fails once any failure counts.
    let strict = evaluate(&outcome.summary, &Thresholds::default());
    assert!(!strict.passed);
    assert_eq!(strict.exit_code(), 1);

    let sent = transport.requests();
    assert!(sent.iter().all(|r| r.headers["authorization"] == "Bearer secret"));
    assert!(sent.iter().all(|r| r.headers["x-agency-id"] == "agency-9"));
}

#[tokio::test]
async fn test_run_exports_csv() {
    let loaded = LoadedScenario::from_yaml(CATALOG).unwrap();
    let registry = loaded.registry().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("out").join("smoke");

    let mut args = run_args(MOCK_HOST);
    args.csv = Some(prefix.to_string_lossy().to_string());
    let config = RunConfig::resolve(&loaded.run, &args).unwrap();

    let outcome = run_with_transport(&registry, &config, Arc::new(MockTransport::new()))
        .await
        .unwrap();
    assert!(outcome.verdict.passed);
    assert_eq!(outcome.csv_files.len(), 4);
    assert!(dir.path().join("out/smoke_stats.csv").exists());
    assert!(dir.path().join("out/smoke_stats_history.csv").exists());

    let stats = std::fs::read_to_string(dir.path().join("out/smoke_stats.csv")).unwrap();
    assert!(stats.contains("GET,/api/ok,"));
    assert!(stats.contains("tag,p0,"));
}

#[tokio::test]
async fn test_run_with_unmatched_tags_is_rejected() {
    let loaded = LoadedScenario::from_yaml(CATALOG).unwrap();
    let registry = loaded.registry().unwrap();
    let mut args = run_args(MOCK_HOST);
    args.tags = vec!["nothing".to_string()];
    let config = RunConfig::resolve(&loaded.run, &args).unwrap();

    let transport = MockTransport::new();
    let err = run_with_transport(&registry, &config, Arc::new(transport.clone()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No scenario matches tags"));
    assert_eq!(transport.sent(), 0);
}

#[tokio::test]
async fn test_quick_test_classifies_errors() {
    let transport = MockTransport::new().failing(TransportError::Timeout);
    let args = QuickArgs {
        host: MOCK_HOST.to_string(),
        path: "/api/health/".to_string(),
        requests: 25,
        concurrency: 5,
        auth_token: "secret".to_string(),
        agency_id: None,
    };
    let summary = quick_test_with(&args, Arc::new(transport.clone())).await.unwrap();
    assert_eq!(summary.total.requests, 25);
    assert_eq!(summary.total.failures, 25);
    assert_eq!(summary.exceptions.len(), 1);
    assert!(transport.peak_in_flight() <= 5);
}

// ============================================================================
// Over HTTP
// ============================================================================

#[tokio::test]
async fn test_run_against_target_server() {
    let server = TargetServer::start().await.unwrap();
    let yaml = r#"
name: http
think_time: { type: constant, secs: 0.05 }
run:
  users: 3
  spawn_rate: 30
  run_time: 1s
scenarios:
  - name: Reader
    actions:
      - name: ok
        steps:
          - path: /api/ok
      - name: whoami
        steps:
          - path: /api/whoami
            query: { view: tree }
"#;
    let loaded = LoadedScenario::from_yaml(yaml).unwrap();
    let registry = loaded.registry().unwrap();
    let args = RunArgs {
        host: Some(server.url()),
        headless: true,
        auth_token: "secret".to_string(),
        tenant_header: "X-Agency-Id".to_string(),
        ..RunArgs::default()
    };
    let config = RunConfig::resolve(&loaded.run, &args).unwrap();
    assert_eq!(config.users, 3);

    let outcome = run_load_test(&registry, &config).await.unwrap();
    assert_eq!(outcome.stop.reason, StopReason::DurationElapsed);
    assert_eq!(outcome.summary.total.requests, server.total_hits());
    assert_eq!(outcome.summary.total.failures, 0);
    assert!(outcome.verdict.passed);
}

#[tokio::test]
async fn test_quick_test_over_http() {
    let server = TargetServer::start().await.unwrap();
    let args = QuickArgs {
        host: server.url(),
        path: "/api/ok".to_string(),
        requests: 20,
        concurrency: 4,
        auth_token: "secret".to_string(),
        agency_id: Some("agency-1".to_string()),
    };
    let summary = quick_test(&args).await.unwrap();
    assert_eq!(summary.total.requests, 20);
    assert_eq!(summary.total.failures, 0);
    assert_eq!(server.hits("/api/ok"), 20);
}
