use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use deacon_executor::mock::MockRuntime;
use deacon_orchestrator::{
    AlertDispatcher, InstanceManager, MaintenanceTask, ManagerSettings, Metrics, StateStore,
    SweepReport,
};
use deacon_server::{create_app, spawn_server, AppState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tower::ServiceExt;

struct CountingTask {
    name: &'static str,
    runs: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl MaintenanceTask for CountingTask {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self) -> SweepReport {
        tokio::time::sleep(self.delay).await;
        self.runs.fetch_add(1, Ordering::SeqCst);
        SweepReport::new(self.name)
    }
}

fn counting(name: &'static str, delay: Duration) -> Arc<CountingTask> {
    Arc::new(CountingTask {
        name,
        runs: AtomicUsize::new(0),
        delay,
    })
}

struct TestApp {
    _dir: TempDir,
    runtime: MockRuntime,
    state: AppState,
    upgrade: Arc<CountingTask>,
    health: Arc<CountingTask>,
    backup: Arc<CountingTask>,
}

impl TestApp {
    fn app(&self) -> Router {
        create_app(self.state.clone())
    }
}

async fn create_test_app() -> TestApp {
    create_test_app_with_delay(Duration::ZERO).await
}

async fn create_test_app_with_delay(delay: Duration) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("instances.json")).await.unwrap());
    let runtime = MockRuntime::new();
    let shared = Arc::new(runtime.clone());
    let metrics = Arc::new(Metrics::new());
    let alerts = Arc::new(AlertDispatcher::new(None, 32, metrics.clone()).unwrap());
    let manager = Arc::new(InstanceManager::new(
        store,
        shared.clone(),
        shared,
        ManagerSettings {
            image: "openclaw-launcher/instance:test".to_string(),
            network: None,
            dns: vec![],
            stop_grace: Duration::from_secs(1),
        },
        metrics.clone(),
    ));

    let upgrade = counting("upgrade", delay);
    let health = counting("health", delay);
    let backup = counting("backup", delay);
    let state = AppState::new(
        manager,
        health.clone(),
        upgrade.clone(),
        backup.clone(),
        alerts,
        metrics,
    );
    TestApp {
        _dir: dir,
        runtime,
        state,
        upgrade,
        health,
        backup,
    }
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn wait_for(counter: &AtomicUsize, expected: usize) {
    for _ in 0..100 {
        if counter.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("background task did not run");
}

#[tokio::test]
async fn test_health_endpoint() {
    let t = create_test_app().await;
    let (status, json) = send_json(t.app(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_unknown_path_is_json_404() {
    let t = create_test_app().await;
    let (status, json) = send_json(t.app(), "GET", "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Not found");
}

#[tokio::test]
async fn test_wrong_method_is_json_405() {
    let t = create_test_app().await;
    let (status, json) = send_json(t.app(), "GET", "/instances/launch", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(json["error"], "Method not allowed");

    let (status, json) = send_json(t.app(), "POST", "/instances", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert!(json["error"].is_string());
    assert!(t.runtime.calls().await.is_empty());
}

#[tokio::test]
async fn test_launch_without_name_is_rejected_before_manager() {
    let t = create_test_app().await;

    let (status, json) = send_json(
        t.app(),
        "POST",
        "/instances/launch",
        Some(json!({ "memLimit": "1g" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "name required");

    let (status, json) = send_json(t.app(), "POST", "/instances/launch", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (status, _) = send(
        t.app(),
        "POST",
        "/instances/launch",
        Some(json!({ "name": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(t.runtime.calls().await.is_empty());
    assert!(t.state.manager.store().is_empty().await);
}

#[tokio::test]
async fn test_malformed_input_is_400() {
    let t = create_test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/instances/stop")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = t.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        t.app(),
        "POST",
        "/instances/launch",
        Some(json!({ "name": "alpha", "memLimit": "lots" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        t.app(),
        "POST",
        "/instances/launch",
        Some(json!({ "name": "bad/name" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(t.runtime.calls().await.is_empty());
}

#[tokio::test]
async fn test_launch_list_stop_destroy_flow() {
    let t = create_test_app().await;

    let (status, json) = send_json(
        t.app(),
        "POST",
        "/instances/launch",
        Some(json!({
            "name": "alpha",
            "secretEnv": { "API_KEY": "s3cret" },
            "cpuLimit": 1.5,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "launched");
    assert_eq!(json["containerName"], "openclaw-alpha");
    assert_eq!(json["record"]["cpuLimit"], 1.5);
    assert_eq!(json["record"]["memLimit"], "4g");
    assert_eq!(json["record"]["secretEnvKeys"], json!(["API_KEY"]));

    let (_, json) = send_json(
        t.app(),
        "POST",
        "/instances/launch",
        Some(json!({ "name": "alpha", "cpuLimit": 1.5 })),
    )
    .await;
    assert_eq!(json["status"], "already_running");

    let (status, json) = send_json(t.app(), "GET", "/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["name"], "alpha");
    assert_eq!(json[0]["status"], "running");
    assert_eq!(json[0]["liveStatus"], "running");

    let (status, json) = send_json(
        t.app(),
        "POST",
        "/instances/stop",
        Some(json!({ "name": "alpha" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "stopped");

    let (_, json) = send_json(
        t.app(),
        "POST",
        "/instances/destroy",
        Some(json!({ "name": "alpha" })),
    )
    .await;
    assert_eq!(json["status"], "destroyed");

    let (_, json) = send_json(t.app(), "GET", "/instances", None).await;
    assert_eq!(json[0]["status"], "destroyed");
    assert_eq!(json[0]["liveStatus"], "not_found");
}

#[tokio::test]
async fn test_legacy_snake_case_launch_body() {
    let t = create_test_app().await;
    let (status, json) = send_json(
        t.app(),
        "POST",
        "/instances/launch",
        Some(json!({
            "name": "legacy",
            "telegram_bot_token": "123:abc",
            "env_keys": { "TOKEN": "x" },
            "mem_limit": "2g",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["record"]["memLimit"], "2g");
    assert_eq!(json["record"]["secretEnvKeys"], json!(["TOKEN"]));
}

#[tokio::test]
async fn test_stop_unknown_instance_is_not_found_result() {
    let t = create_test_app().await;
    let (status, json) = send_json(
        t.app(),
        "POST",
        "/instances/stop",
        Some(json!({ "name": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "not_found");

    let (status, _) = send_json(t.app(), "POST", "/instances/destroy", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_runtime_failure_is_500() {
    let t = create_test_app().await;
    t.runtime.fail_next_create("no space left on device").await;
    let (status, json) = send_json(
        t.app(),
        "POST",
        "/instances/launch",
        Some(json!({ "name": "alpha" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("no space left on device"));
}

#[tokio::test]
async fn test_maintenance_triggers_run_in_background() {
    let t = create_test_app().await;

    for (path, task) in [
        ("/upgrade", &t.upgrade),
        ("/healthcheck", &t.health),
        ("/backup", &t.backup),
    ] {
        let (status, json) = send_json(t.app(), "POST", path, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "triggered");
        wait_for(&task.runs, 1).await;
    }
}

#[tokio::test]
async fn test_trigger_returns_before_sweep_completes() {
    let t = create_test_app_with_delay(Duration::from_millis(300)).await;

    let (status, _) = send_json(t.app(), "POST", "/upgrade", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.upgrade.runs.load(Ordering::SeqCst), 0);

    t.state.drain_background(Duration::from_secs(5)).await;
    assert_eq!(t.upgrade.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_drain_abandons_after_grace() {
    let t = create_test_app_with_delay(Duration::from_secs(60)).await;
    send(t.app(), "POST", "/backup", None).await;

    let started = std::time::Instant::now();
    t.state.drain_background(Duration::from_millis(50)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(t.backup.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_metrics_and_alerts_endpoints() {
    let t = create_test_app().await;
    send(
        t.app(),
        "POST",
        "/instances/launch",
        Some(json!({ "name": "alpha" })),
    )
    .await;
    t.state
        .alerts
        .send("Instance not running", "openclaw-x is exited", deacon_common::Severity::Critical)
        .await;

    let response = t
        .app()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("deacon_launches_total 1"));
    assert!(text.contains("deacon_alerts_total 1"));
    assert!(text.contains("deacon_instances_known 1"));

    let (status, json) = send_json(t.app(), "GET", "/alerts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["severity"], "critical");
    assert_eq!(json[0]["title"], "Instance not running");
}

#[tokio::test]
async fn test_api_answers_while_startup_sweep_runs() {
    let t = create_test_app_with_delay(Duration::from_secs(3600)).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let server = spawn_server(listener, t.app(), rx);

    let health = t.health.clone();
    let sweep = tokio::spawn(async move { health.run().await });

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("healthy"));
    assert_eq!(t.health.runs.load(Ordering::SeqCst), 0);

    sweep.abort();
    tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}
