//! Local HTTP target for end-to-end tests.
//!
//! Endpoints:
//! - `GET /api/ok` - 200 with a small JSON body
//! - `GET /api/status/:code` - responds with the given status
//! - `GET /api/slow/:ms` - 200 after sleeping
//! - `GET /api/whoami` - echoes the auth and tenant headers
//! - `POST /api/conversations/` - 201 with a fresh conversation id
//! - `POST /api/echo` - echoes the JSON body

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Json, Path},
    http::{HeaderMap, StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

#[derive(Default)]
struct ServerState {
    hits: Mutex<HashMap<String, u64>>,
}

impl ServerState {
    fn hit(&self, uri: &Uri) {
        *self.hits.lock().entry(uri.path().to_string()).or_insert(0) += 1;
    }
}

/// A running target server bound to an ephemeral local port. The server task
/// is aborted on drop.
pub struct TargetServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl TargetServer {
    pub async fn start() -> std::io::Result<Self> {
        let state = Arc::new(ServerState::default());
        let app = build_router(state.clone());

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "Starting target server");

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    /// Base URL, e.g. `http://127.0.0.1:40123`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests served for `path`.
    pub fn hits(&self, path: &str) -> u64 {
        self.state.hits.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> u64 {
        self.state.hits.lock().values().sum()
    }
}

impl Drop for TargetServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/ok", get(ok_handler))
        .route("/api/status/:code", get(status_handler))
        .route("/api/slow/:ms", get(slow_handler))
        .route("/api/whoami", get(whoami_handler))
        .route("/api/conversations/", post(conversation_handler))
        .route("/api/echo", post(echo_handler))
        .fallback(not_found_handler)
        .layer(Extension(state))
}

async fn ok_handler(Extension(state): Extension<Arc<ServerState>>, uri: Uri) -> impl IntoResponse {
    state.hit(&uri);
    Json(json!({ "status": "ok" }))
}

async fn status_handler(
    Extension(state): Extension<Arc<ServerState>>,
    uri: Uri,
    Path(code): Path<u16>,
) -> impl IntoResponse {
    state.hit(&uri);
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "code": code })))
}

async fn slow_handler(
    Extension(state): Extension<Arc<ServerState>>,
    uri: Uri,
    Path(ms): Path<u64>,
) -> impl IntoResponse {
    state.hit(&uri);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Json(json!({ "slept_ms": ms }))
}

async fn whoami_handler(
    Extension(state): Extension<Arc<ServerState>>,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.hit(&uri);
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    Json(json!({
        "authorization": header("authorization"),
        "agency": header("x-agency-id"),
        "query": uri.query().unwrap_or_default(),
    }))
}

async fn conversation_handler(
    Extension(state): Extension<Arc<ServerState>>,
    uri: Uri,
) -> impl IntoResponse {
    state.hit(&uri);
    (StatusCode::CREATED, Json(json!({ "id": Uuid::new_v4().to_string() })))
}

async fn echo_handler(
    Extension(state): Extension<Arc<ServerState>>,
    uri: Uri,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.hit(&uri);
    Json(body)
}

async fn not_found_handler(Extension(state): Extension<Arc<ServerState>>, uri: Uri) -> impl IntoResponse {
    state.hit(&uri);
    (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found." })))
}
