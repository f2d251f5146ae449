//! HTTP router and shared application state

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tower_http::{
    catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

use super::auth::auth_middleware;
use super::rest;
use super::rpc::rpc_handler;
use crate::cluster::{DirectoryClient, SchedulerClient, ToolHost};
use crate::failsafe::AdmissionController;
use crate::oauth::provider::OAuth2Provider;
use crate::token::{DownstreamMinter, SessionCache};

/// Shared application state
pub struct AppState {
    /// Embedded authorization server, when `issuer-url` is configured
    pub provider: Option<Arc<OAuth2Provider>>,
    /// Downstream token minter, when `trust-domain` is configured
    pub minter: Option<Arc<DownstreamMinter>>,
    /// Identity/session cache for downstream tokens
    pub session_cache: Arc<SessionCache>,
    /// Per-identity admission control
    pub admission: Arc<AdmissionController>,
    /// Scheduler client seam
    pub scheduler: Arc<dyn SchedulerClient>,
    /// Directory client seam
    pub directory: Option<Arc<dyn DirectoryClient>>,
    /// Tool host for the JSON-RPC surface
    pub tool_host: Arc<dyn ToolHost>,
    /// Compiled glob patterns naming read-only tools
    pub read_only_tools: Vec<glob::Pattern>,
    /// Whether /rpc is exposed
    pub rpc_enabled: bool,
    /// Sandbox upload cap in bytes
    pub sandbox_max_bytes: u64,
    /// Prometheus render handle, when the recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

/// Assemble the full router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/openapi.json", get(openapi_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .merge(rest::routes(state.sandbox_max_bytes));

    if state.rpc_enabled {
        router = router.route("/rpc", post(rpc_handler));
    }

    let mut app = router
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ))
        .with_state(Arc::clone(&state));

    if let Some(provider) = &state.provider {
        app = app.merge(OAuth2Provider::routes(Arc::clone(provider)));
    }

    app.layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
}

async fn healthz_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn readyz_handler() -> Json<Value> {
    Json(json!({"status": "ready"}))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

async fn openapi_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut paths = json!({
        "/healthz": {"get": {"summary": "Liveness probe"}},
        "/readyz": {"get": {"summary": "Readiness probe"}},
        "/metrics": {"get": {"summary": "Prometheus text exposition"}},
        "/api/v1/jobs": {
            "get": {"summary": "List jobs matching a constraint"},
            "post": {"summary": "Submit a job"},
            "delete": {"summary": "Remove jobs by constraint"},
            "patch": {"summary": "Edit jobs by constraint"},
        },
        "/api/v1/jobs/{id}": {
            "get": {"summary": "Fetch a job ad"},
            "delete": {"summary": "Remove a job"},
            "patch": {"summary": "Edit job attributes"},
        },
        "/api/v1/jobs/{id}/hold": {"post": {"summary": "Hold a job"}},
        "/api/v1/jobs/{id}/release": {"post": {"summary": "Release a job"}},
        "/api/v1/jobs/hold": {"post": {"summary": "Hold jobs by constraint"}},
        "/api/v1/jobs/release": {"post": {"summary": "Release jobs by constraint"}},
        "/api/v1/jobs/{id}/input": {"put": {"summary": "Upload the input sandbox (tar)"}},
        "/api/v1/jobs/{id}/output": {"get": {"summary": "Download the output sandbox (tar)"}},
        "/api/v1/directory/ads": {"get": {"summary": "Query daemon advertisements"}},
        "/api/v1/directory/ads/{adType}": {"get": {"summary": "Query ads of one type"}},
        "/api/v1/directory/ads/{adType}/{name}": {"get": {"summary": "Query one named ad"}},
    });
    if state.rpc_enabled {
        paths["/rpc"] = json!({"post": {"summary": "JSON-RPC 2.0 tool-call endpoint"}});
    }
    if state.provider.is_some() {
        for (path, summary) in [
            ("/oauth2/authorize", "OAuth2 authorization endpoint"),
            ("/oauth2/token", "OAuth2 token endpoint"),
            ("/oauth2/introspect", "Token introspection"),
            ("/oauth2/revoke", "Token revocation"),
            ("/oauth2/register", "Dynamic client registration"),
            ("/oauth2/device/authorize", "Device authorization"),
            ("/oauth2/device/verify", "Device user-code verification"),
            ("/.well-known/oauth-authorization-server", "RFC 8414 metadata"),
        ] {
            paths[path] = json!({"summary": summary});
        }
    }
    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "description": env!("CARGO_PKG_DESCRIPTION"),
        },
        "paths": paths,
    }))
}
