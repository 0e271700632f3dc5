//! HTTP API Server
//!
//! REST API over the replicated store, plus node status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::staging;
use crate::store::{self, Mutation, WriteOptions};

/// Entries returned by a range query when no limit is given
const DEFAULT_RANGE_LIMIT: usize = 1000;

/// Shared application state
pub struct AppState {
    pub node: Node,
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node: Node) -> Self {
        let state = Arc::new(AppState {
            node,
            started: Instant::now(),
        });
        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/kv/:key", get(handle_get).put(handle_put).delete(handle_delete))
            .route("/batch", post(handle_batch))
            .route("/range", get(handle_range))
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Put request
#[derive(Debug, Deserialize, Serialize)]
pub struct PutRequest {
    pub value: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// One entry of a batch request
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum BatchOp {
    Put { key: String, value: String },
    Delete { key: String },
}

/// Batch request
#[derive(Debug, Deserialize, Serialize)]
pub struct BatchRequest {
    pub ops: Vec<BatchOp>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Range query
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    #[serde(default)]
    pub start: String,
    pub end: Option<String>,
    pub limit: Option<usize>,
}

/// A stored entry
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

/// Write response
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
    pub message: Option<String>,
}

/// Peer status entry
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerStatus {
    pub peer: String,
    pub state: String,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node: String,
    pub ready: bool,
    pub uptime_seconds: u64,
    pub ready_peers: Vec<String>,
    pub peers: Vec<PeerStatus>,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node: String,
    pub ready: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(e: Error) -> Response {
    let (status, code) = match &e {
        Error::InvalidOperation(_) => (StatusCode::BAD_REQUEST, "INVALID_OPERATION"),
        Error::ConnectionFailed { .. } | Error::Disconnected(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "PEER_UNAVAILABLE")
        }
        Error::Remote { .. } => (StatusCode::BAD_GATEWAY, "REMOTE_ERROR"),
        Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    tracing::warn!("Request failed: {}", e);

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn written(message: &str) -> Response {
    Json(WriteResponse {
        success: true,
        message: Some(message.to_string()),
    })
    .into_response()
}

fn write_options(ttl_secs: Option<u64>) -> WriteOptions {
    match ttl_secs {
        Some(secs) if secs > 0 => WriteOptions::with_ttl(Duration::from_secs(secs)),
        _ => WriteOptions::default(),
    }
}

// ============ Handlers ============

async fn handle_get(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.node.store().get(key.as_bytes()).await {
        Ok(Some(value)) => Json(KvEntry {
            key,
            value: String::from_utf8_lossy(&value).into_owned(),
        })
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Key not found: {}", key),
                code: "NOT_FOUND".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_put(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<PutRequest>,
) -> Response {
    let options = write_options(req.ttl_secs);
    match state.node.store().put_with(key.as_bytes(), req.value.as_bytes(), options).await {
        Ok(()) => written("Put replicated"),
        Err(e) => error_response(e),
    }
}

async fn handle_delete(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.node.store().delete(key.as_bytes()).await {
        Ok(()) => written("Delete replicated"),
        Err(e) => error_response(e),
    }
}

async fn handle_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Response {
    let ops = req
        .ops
        .into_iter()
        .map(|op| match op {
            BatchOp::Put { key, value } => Mutation::put(key, value),
            BatchOp::Delete { key } => Mutation::delete(key),
        })
        .collect();

    match state.node.store().batch_with(ops, write_options(req.ttl_secs)).await {
        Ok(()) => written("Batch replicated"),
        Err(e) => error_response(e),
    }
}

/// Committed entries in `[start, end)`, without staged or housekeeping keys
async fn handle_range(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RANGE_LIMIT);
    let result: Result<Vec<KvEntry>> = async {
        let stream = state
            .node
            .store()
            .range(query.start.as_bytes(), query.end.as_ref().map(String::as_bytes))
            .await?;
        stream
            .try_filter(|(key, _)| {
                let visible = !staging::is_staged(key) && !store::is_housekeeping(key);
                futures::future::ready(visible)
            })
            .take(limit)
            .map_ok(|(key, value)| KvEntry {
                key: String::from_utf8_lossy(&key).into_owned(),
                value: String::from_utf8_lossy(&value).into_owned(),
            })
            .try_collect::<Vec<_>>()
            .await
    }
    .await;

    match result {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready_peers = state
        .node
        .ready_peers()
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    let peers = state
        .node
        .peer_states()
        .await
        .into_iter()
        .map(|(peer, s)| PeerStatus {
            peer: peer.to_string(),
            state: s.to_string(),
        })
        .collect();

    Json(StatusResponse {
        node: state.node.identity().to_string(),
        ready: state.node.is_ready(),
        uptime_seconds: state.started.elapsed().as_secs(),
        ready_peers,
        peers,
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: !state.node.is_closed(),
        node: state.node.identity().to_string(),
        ready: state.node.is_ready(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn server() -> HttpServer {
        let node = Node::create(Arc::new(MemoryStore::new()), ClusterConfig::new("127.0.0.1", 4200))
            .await
            .unwrap();
        HttpServer::new(ApiConfig::default(), node)
    }

    async fn send(router: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let server = server().await;

        let (status, _) = send(server.router(), "PUT", "/kv/greeting", Some(r#"{"value":"hello"}"#)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(server.router(), "GET", "/kv/greeting", None).await;
        assert_eq!(status, StatusCode::OK);
        let entry: KvEntry = serde_json::from_slice(&body).unwrap();
        assert_eq!(entry.value, "hello");

        let (status, _) = send(server.router(), "DELETE", "/kv/greeting", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(server.router(), "GET", "/kv/greeting", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_batch_and_range() {
        let server = server().await;
        let batch = r#"{"ops":[
            {"op":"put","key":"X_1","value":"one"},
            {"op":"put","key":"X_2","value":"two"},
            {"op":"put","key":"Y_1","value":"other"},
            {"op":"delete","key":"X_3"}
        ]}"#;
        let (status, _) = send(server.router(), "POST", "/batch", Some(batch)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(server.router(), "GET", "/range?start=X_&end=X_~", None).await;
        assert_eq!(status, StatusCode::OK);
        let entries: Vec<KvEntry> = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            entries,
            vec![
                KvEntry { key: "X_1".into(), value: "one".into() },
                KvEntry { key: "X_2".into(), value: "two".into() },
            ]
        );

        let (_, body) = send(server.router(), "GET", "/range?limit=1", None).await;
        let entries: Vec<KvEntry> = serde_json::from_slice(&body).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_status_and_health() {
        let server = server().await;

        let (status, body) = send(server.router(), "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.node, "127.0.0.1:4200");
        assert!(status.ready);
        assert!(status.peers.is_empty());

        let (_, body) = send(server.router(), "GET", "/health", None).await;
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert!(health.healthy);
    }
}
