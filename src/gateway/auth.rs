//! Request authentication middleware
//!
//! Extracts and introspects the bearer credential, resolves the end-user,
//! mints the downstream scheduler token, binds it to a cached session
//! container, applies admission control, and stamps the security context
//! onto the request. Directory-query paths are explicitly unauthenticated
//! and must never see a 401 from here.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::router::AppState;
use crate::cluster::SecurityContext;
use crate::failsafe::QueryClass;
use crate::{Error, Result};

/// Paths that require a bearer credential
fn is_protected(path: &str) -> bool {
    path == "/rpc" || path.starts_with("/api/v1/jobs")
}

/// Directory-query paths: unauthenticated, rate limited by identity when
/// one is presented, else by client address
fn is_directory(path: &str) -> bool {
    path.starts_with("/api/v1/directory")
}

fn extract_bearer(request: &Request<Body>) -> Option<String> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::to_string)
}

/// `WWW-Authenticate` challenge per RFC 6750; the realm is present iff the
/// provider is configured
fn challenge(realm: Option<&str>, error: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(realm) = realm {
        parts.push(format!("realm=\"{realm}\""));
    }
    if let Some(error) = error {
        parts.push(format!("error=\"{error}\""));
    }
    if parts.is_empty() {
        "Bearer".to_string()
    } else {
        format!("Bearer {}", parts.join(", "))
    }
}

fn unauthorized(realm: Option<&str>, error: Option<&str>, message: &str) -> Response {
    telemetry_metrics::counter!("grid_gateway_auth_failures_total").increment(1);
    (
        StatusCode::UNAUTHORIZED,
        [("www-authenticate", challenge(realm, error))],
        Json(json!({
            "error": "authentication",
            "message": message,
            "code": 401,
        })),
    )
        .into_response()
}

fn rate_limited(retry_after: u64) -> Response {
    telemetry_metrics::counter!("grid_gateway_rate_limited_total").increment(1);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", retry_after.to_string())],
        Json(json!({
            "error": "rate_limited",
            "message": "too many requests",
            "code": 429,
        })),
    )
        .into_response()
}

/// Authentication middleware applied to the whole router
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    telemetry_metrics::counter!("grid_gateway_requests_total").increment(1);

    if is_directory(&path) {
        // Identity when a valid bearer is presented, client address otherwise
        let identity = match (extract_bearer(&request), &state.provider) {
            (Some(token), Some(provider)) => provider
                .introspect_token(&token)
                .await
                .map(|t| t.subject),
            _ => None,
        };
        let identity = identity.unwrap_or_else(|| client_address(&request));

        if let Err(Error::RateLimited { retry_after }) =
            state.admission.admit(QueryClass::DirectoryQuery, &identity)
        {
            return rate_limited(retry_after);
        }
        return next.run(request).await;
    }

    if !is_protected(&path) {
        return next.run(request).await;
    }

    let realm = state.provider.as_deref().map(|p| p.issuer().to_string());
    let realm = realm.as_deref();

    let Some(token) = extract_bearer(&request) else {
        debug!(path = %path, "Missing bearer credential");
        return unauthorized(realm, None, "missing bearer credential");
    };

    let Some(provider) = &state.provider else {
        // RFC 6750: a bare challenge when no authorization server is wired
        return unauthorized(None, None, "no authorization server configured");
    };

    let Some(introspected) = provider.introspect_token(&token).await else {
        debug!(path = %path, "Bearer rejected by introspection");
        return unauthorized(realm, Some("invalid_token"), "token is not active");
    };

    if introspected.subject.is_empty() {
        return unauthorized(realm, Some("invalid_token"), "token carries no subject");
    }

    let ctx = match build_context(&state, &introspected).await {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(error = %e, "Downstream credential minting failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal",
                    "message": "internal error",
                    "code": 500,
                })),
            )
                .into_response();
        }
    };

    if let Err(Error::RateLimited { retry_after }) = state
        .admission
        .admit(QueryClass::SchedulerQuery, &ctx.subject)
    {
        return rate_limited(retry_after);
    }

    request.extensions_mut().insert(ctx);
    next.run(request).await
}

/// Build the request security context: mint the downstream token and bind
/// it to the identity cache
async fn build_context(
    state: &AppState,
    introspected: &crate::oauth::provider::IntrospectedToken,
) -> Result<SecurityContext> {
    let mut ctx = SecurityContext::identity_only(
        introspected.subject.clone(),
        introspected.scopes.clone(),
    );
    if let Some(minter) = &state.minter {
        let downstream = minter.mint(&introspected.subject, &introspected.scopes)?;
        let entry = state.session_cache.add(&downstream)?;
        ctx.subject = entry.subject.clone();
        ctx.session_handle = Some(Arc::clone(&entry.session));
        ctx.downstream_token = Some(downstream);
    }
    Ok(ctx)
}

fn client_address(request: &Request<Body>) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown-client".to_string())
}
