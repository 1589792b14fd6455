//! HTTP API server.
//!
//! Runs on a separate tokio task and exposes the block engine: mutating
//! and listing endpoints behind a bearer token, plus open `/health` and
//! `/metrics` endpoints for probes and Prometheus scraping.

use crate::config::ScanConfig;
use crate::engine::Reconciler;
use crate::error::EngineError;
use crate::metrics;
use crate::scan;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared state for all API handlers.
pub struct ApiState {
    pub reconciler: Arc<Reconciler>,
    pub token: String,
    pub scan: ScanConfig,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        metrics::record_engine_error(self.error_code());
        let status = match &self {
            EngineError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            EngineError::Backend(_) | EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct BlockRequest {
    ip: String,
    port: Option<u16>,
    reason: Option<String>,
    /// Seconds until the block expires; absent blocks indefinitely.
    ttl: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UnblockRequest {
    ip: String,
    port: Option<u16>,
}

/// Bearer-token check for the protected routes.
///
/// Rejections are logged with the client address in the same shape the
/// detector's default patterns match, so bruteforcing this API feeds the
/// same sliding windows as any other guarded service.
async fn require_token(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented != Some(state.token.as_str()) {
        metrics::inc(&metrics::AUTH_FAILURES);
        warn!(client = %client.ip(), "AUTH_FAILED: Unauthorized request");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Unauthorized" })),
        )
            .into_response();
    }
    next.run(req).await
}

async fn block_handler(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let intent = state
        .reconciler
        .block(&req.ip, req.port, req.reason.as_deref(), req.ttl)
        .await?;
    Ok(Json(json!({
        "status": "blocked",
        "ip": req.ip,
        "port": intent.port,
        "expiresAt": intent.expires_at,
    })))
}

async fn unblock_handler(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<UnblockRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let removed = state.reconciler.unblock(&req.ip, req.port).await?;
    Ok(Json(json!({
        "status": "unblocked",
        "ip": req.ip,
        "rulesRemoved": removed,
    })))
}

async fn list_handler(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let blocks = state.reconciler.list_all().await?;
    Ok(Json(json!({
        "count": blocks.len(),
        "blocks": blocks,
    })))
}

async fn clients_handler(State(state): State<Arc<ApiState>>) -> Response {
    match scan::discover_clients(&state.scan).await {
        Ok(clients) => Json(json!({
            "count": clients.len(),
            "clients": clients,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "network scan failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Handler for GET /metrics - returns Prometheus metrics in text format.
async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

/// Build the API router over shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let protected = Router::new()
        .route("/block", post(block_handler))
        .route("/unblock", post(unblock_handler))
        .route("/list", get(list_handler))
        .route("/clients", get(clients_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .merge(protected)
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the HTTP API server on the calling task. The daemon's background
/// tasks live and die with this loop, so any failure is returned for the
/// caller to treat as fatal.
pub async fn run_http_server(bind: SocketAddr, state: Arc<ApiState>) -> std::io::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await.map_err(|e| {
        error!("Failed to bind HTTP server on {}: {}", bind, e);
        e
    })?;
    info!("HTTP API listening on {}", bind);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FirewallConfig;
    use crate::db::Database;
    use crate::engine::Reconciler;
    use crate::firewall::{BackendError, RuleBackend, rule::ChainRule};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::collections::HashSet;
    use std::net::IpAddr;
    use std::sync::Mutex as StdMutex;
    use tower::ServiceExt;

    struct NullBackend {
        rules: StdMutex<Vec<ChainRule>>,
    }

    #[async_trait]
    impl RuleBackend for NullBackend {
        async fn ensure_chain(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn apply_block(
            &self,
            address: IpAddr,
            port: Option<u16>,
            comment: Option<&str>,
        ) -> Result<(), BackendError> {
            self.rules.lock().unwrap().push(ChainRule {
                source: address,
                port,
                comment: comment.map(String::from),
                raw_args: vec![],
            });
            Ok(())
        }

        async fn remove_block(
            &self,
            address: IpAddr,
            port: Option<u16>,
        ) -> Result<u64, BackendError> {
            let mut rules = self.rules.lock().unwrap();
            let before = rules.len();
            rules.retain(|r| r.source != address || (port.is_some() && r.port != port));
            Ok((before - rules.len()) as u64)
        }

        async fn delete_rule(&self, rule: &ChainRule) -> Result<(), BackendError> {
            let mut rules = self.rules.lock().unwrap();
            if let Some(pos) = rules
                .iter()
                .position(|r| r.source == rule.source && r.port == rule.port)
            {
                rules.remove(pos);
            }
            Ok(())
        }

        async fn list_rules(&self) -> Result<Vec<ChainRule>, BackendError> {
            Ok(self.rules.lock().unwrap().clone())
        }

        async fn list_blocked_addresses(&self) -> Result<HashSet<IpAddr>, BackendError> {
            Ok(self
                .rules
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.source)
                .collect())
        }
    }

    async fn test_state() -> Arc<ApiState> {
        let db = Database::new(":memory:").await.unwrap();
        let backend = Arc::new(NullBackend {
            rules: StdMutex::new(Vec::new()),
        });
        let reconciler = Arc::new(Reconciler::new(
            backend,
            db,
            FirewallConfig::default().default_comment,
        ));
        Arc::new(ApiState {
            reconciler,
            token: "testtoken".to_string(),
            scan: ScanConfig::default(),
        })
    }

    async fn test_app() -> Router {
        router(test_state().await)
    }

    fn authed(req: HttpRequest<Body>) -> HttpRequest<Body> {
        let (mut parts, body) = req.into_parts();
        parts.headers.insert(
            header::AUTHORIZATION,
            "Bearer testtoken".parse().unwrap(),
        );
        HttpRequest::from_parts(parts, body)
    }

    fn with_client(req: HttpRequest<Body>) -> HttpRequest<Body> {
        let mut req = req;
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));
        req
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let app = test_app().await;
        let resp = app
            .oneshot(with_client(
                HttpRequest::get("/health").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_requires_token() {
        let app = test_app().await;
        let resp = app
            .oneshot(with_client(
                HttpRequest::get("/list").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let app = test_app().await;
        let req = HttpRequest::get("/list")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(with_client(req)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_block_then_list() {
        let app = test_app().await;

        let req = authed(
            HttpRequest::post("/block")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"ip": "1.2.3.4", "reason": "manual", "ttl": 3600}"#,
                ))
                .unwrap(),
        );
        let resp = app.clone().oneshot(with_client(req)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "blocked");
        assert_eq!(body["ip"], "1.2.3.4");

        let resp = app
            .oneshot(with_client(authed(
                HttpRequest::get("/list").body(Body::empty()).unwrap(),
            )))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["blocks"][0]["address"], "1.2.3.4");
        assert_eq!(body["blocks"][0]["reason"], "manual");
    }

    #[tokio::test]
    async fn test_invalid_address_is_bad_request() {
        let app = test_app().await;
        let req = authed(
            HttpRequest::post("/block")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"ip": "not-an-ip"}"#))
                .unwrap(),
        );
        let resp = app.oneshot(with_client(req)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unblock_absent_is_ok() {
        let app = test_app().await;
        let req = authed(
            HttpRequest::post("/unblock")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"ip": "9.9.9.9"}"#))
                .unwrap(),
        );
        let resp = app.oneshot(with_client(req)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "unblocked");
        assert_eq!(body["rulesRemoved"], 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_surfaced() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        let err = run_http_server(addr, test_state().await)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_metrics_is_open() {
        let app = test_app().await;
        let resp = app
            .oneshot(with_client(
                HttpRequest::get("/metrics").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
