//! HTTP control surface for the deacon daemon.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use deacon_common::{DeaconError, ResourceLimits, DEFAULT_CPU_LIMIT, DEFAULT_MEM_LIMIT};
use deacon_orchestrator::{
    AlertDispatcher, InstanceManager, LaunchRequest, MaintenanceTask, Metrics,
};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::future::IntoFuture;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    pub health: Arc<dyn MaintenanceTask>,
    pub upgrade: Arc<dyn MaintenanceTask>,
    pub backup: Arc<dyn MaintenanceTask>,
    pub alerts: Arc<AlertDispatcher>,
    pub metrics: Arc<Metrics>,
    background: Arc<Mutex<JoinSet<()>>>,
}

impl AppState {
    pub fn new(
        manager: Arc<InstanceManager>,
        health: Arc<dyn MaintenanceTask>,
        upgrade: Arc<dyn MaintenanceTask>,
        backup: Arc<dyn MaintenanceTask>,
        alerts: Arc<AlertDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            manager,
            health,
            upgrade,
            backup,
            alerts,
            metrics,
            background: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Runs `task` off the request path.
    async fn trigger(&self, task: Arc<dyn MaintenanceTask>) {
        let mut background = self.background.lock().await;
        // reap whatever already finished
        while let Some(Some(_)) = background.join_next().now_or_never() {}
        info!(task = task.name(), "Maintenance sweep triggered via API");
        background.spawn(async move {
            task.run().await;
        });
    }

    /// Waits up to `grace` for API-triggered sweeps, then abandons the rest.
    pub async fn drain_background(&self, grace: Duration) {
        let mut background = std::mem::take(&mut *self.background.lock().await);
        if background.is_empty() {
            return;
        }
        info!(pending = background.len(), "Waiting for background sweeps");
        let drained = tokio::time::timeout(grace, async {
            while background.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(abandoned = background.len(), "Abandoning background sweeps after grace period");
            background.abort_all();
        }
    }
}

// Error type for API handlers
pub struct ApiError(DeaconError);

impl From<DeaconError> for ApiError {
    fn from(err: DeaconError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DeaconError::Validation(_) => StatusCode::BAD_REQUEST,
            DeaconError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match self.0 {
            DeaconError::Validation(msg) => msg,
            other => other.to_string(),
        };
        if status.is_server_error() {
            warn!(%status, error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    if body.is_empty() {
        return Err(DeaconError::Validation("Missing request body".to_string()).into());
    }
    serde_json::from_slice(body)
        .map_err(|e| DeaconError::Validation(format!("Invalid JSON body: {e}")).into())
}

fn required_name(name: Option<String>) -> ApiResult<String> {
    name.filter(|n| !n.is_empty())
        .ok_or_else(|| DeaconError::Validation("name required".to_string()).into())
}

/// Launch request body. Snake-case aliases are accepted for older clients.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchBody {
    pub name: Option<String>,
    #[serde(default, alias = "env_keys", alias = "secret_env")]
    pub secret_env: BTreeMap<String, String>,
    #[serde(alias = "mem_limit")]
    pub mem_limit: Option<String>,
    #[serde(alias = "cpu_limit")]
    pub cpu_limit: Option<f64>,
    #[serde(alias = "telegram_bot_token")]
    pub telegram_bot_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NameBody {
    pub name: Option<String>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/instances", get(list_instances_handler))
        .route("/instances/launch", post(launch_handler))
        .route("/instances/stop", post(stop_handler))
        .route("/instances/destroy", post(destroy_handler))
        .route("/upgrade", post(upgrade_handler))
        .route("/healthcheck", post(healthcheck_handler))
        .route("/backup", post(backup_handler))
        .route("/alerts", get(alerts_handler))
        .route("/metrics", get(metrics_handler))
        .method_not_allowed_fallback(method_not_allowed_handler)
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `app` on `listener` in its own task until `shutdown` flips to true
/// or its sender is dropped.
pub fn spawn_server(
    listener: TcpListener,
    app: Router,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_shutdown(shutdown))
            .into_future(),
    )
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn list_instances_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.list().await)
}

async fn launch_handler(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let body: LaunchBody = parse_body(&body)?;
    let name = required_name(body.name)?;

    let limits = match (body.mem_limit, body.cpu_limit) {
        (None, None) => None,
        (mem, cpu) => Some(ResourceLimits::new(
            mem.unwrap_or_else(|| DEFAULT_MEM_LIMIT.to_string()),
            cpu.unwrap_or(DEFAULT_CPU_LIMIT),
        )?),
    };
    let request = LaunchRequest {
        name,
        secret_env: body.secret_env,
        limits,
        telegram_bot_token: body.telegram_bot_token,
    };
    Ok(Json(state.manager.launch(request).await?))
}

async fn stop_handler(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let body: NameBody = parse_body(&body)?;
    let name = required_name(body.name)?;
    Ok(Json(state.manager.stop(&name).await?))
}

async fn destroy_handler(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let body: NameBody = parse_body(&body)?;
    let name = required_name(body.name)?;
    Ok(Json(state.manager.destroy(&name).await?))
}

async fn upgrade_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.trigger(state.upgrade.clone()).await;
    Json(json!({ "status": "triggered" }))
}

async fn healthcheck_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.trigger(state.health.clone()).await;
    Json(json!({ "status": "triggered" }))
}

async fn backup_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.trigger(state.backup.clone()).await;
    Json(json!({ "status": "triggered" }))
}

async fn alerts_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.alerts.history().await)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let known = state.manager.store().len().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(known),
    )
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

async fn method_not_allowed_handler() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method not allowed" })),
    )
}
