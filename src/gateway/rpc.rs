//! JSON-RPC dispatcher
//!
//! A single POST endpoint carrying JSON-RPC 2.0. Scope gating runs before
//! anything reaches the tool host: read-only methods need read or write
//! capability, write-classified tools need write. The downstream security
//! context is stamped before delegation so tool logic authenticates as the
//! end-user.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::debug;

use super::router::AppState;
use crate::cluster::SecurityContext;
use crate::error::rpc_codes;
use crate::oauth::scope;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::Error;

/// Capability a method or tool demands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Demand {
    Read,
    Write,
}

/// Classify the request before dispatch; `None` means method-not-found
fn demand_of(state: &AppState, request: &JsonRpcRequest) -> Option<Demand> {
    match request.method.as_str() {
        "initialize" | "tools/list" | "resources/list" | "resources/read" => Some(Demand::Read),
        "tools/call" => {
            let name = request.tool_name().unwrap_or_default();
            if state
                .read_only_tools
                .iter()
                .any(|pattern| pattern.matches(name))
            {
                Some(Demand::Read)
            } else {
                Some(Demand::Write)
            }
        }
        _ => None,
    }
}

fn satisfied(demand: Demand, scopes: &[String]) -> bool {
    let granted = scopes.iter().map(String::as_str);
    match demand {
        Demand::Read => {
            scope::grants_read(granted.clone()) || scope::grants_write(granted)
        }
        Demand::Write => scope::grants_write(granted),
    }
}

/// POST /rpc
pub async fn rpc_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<SecurityContext>,
    Json(raw): Json<Value>,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::error(
                    None,
                    rpc_codes::INVALID_REQUEST,
                    format!("invalid JSON-RPC request: {e}"),
                )),
            )
                .into_response();
        }
    };

    if !request.is_valid_version() {
        return (
            StatusCode::BAD_REQUEST,
            Json(JsonRpcResponse::error(
                Some(request.id),
                rpc_codes::INVALID_REQUEST,
                "jsonrpc must be \"2.0\"",
            )),
        )
            .into_response();
    }

    let Some(demand) = demand_of(&state, &request) else {
        return Json(JsonRpcResponse::error(
            Some(request.id),
            rpc_codes::METHOD_NOT_FOUND,
            format!("method {} not found", request.method),
        ))
        .into_response();
    };

    if !satisfied(demand, &ctx.granted_scopes) {
        debug!(
            subject = %ctx.subject,
            method = %request.method,
            "Insufficient scope for JSON-RPC dispatch"
        );
        return (
            StatusCode::FORBIDDEN,
            Json(JsonRpcResponse::error(
                Some(request.id),
                rpc_codes::INSUFFICIENT_SCOPE,
                "insufficient_scope",
            )),
        )
            .into_response();
    }

    let params = request.params.clone().unwrap_or(Value::Null);
    let result = match request.method.as_str() {
        "initialize" => state.tool_host.initialize(&ctx).await,
        "tools/list" => state.tool_host.list_tools(&ctx).await,
        "tools/call" => {
            let name = request.tool_name().unwrap_or_default().to_string();
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            state.tool_host.call_tool(&ctx, &name, arguments).await
        }
        "resources/list" => state.tool_host.list_resources(&ctx).await,
        "resources/read" => {
            let uri = params
                .get("uri")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            state.tool_host.read_resource(&ctx, &uri).await
        }
        _ => unreachable!("demand_of rejected unknown methods"),
    };

    match result {
        Ok(value) => Json(JsonRpcResponse::success(request.id, value)).into_response(),
        Err(e) => {
            let message = match &e {
                Error::JsonRpc { message, .. } => message.clone(),
                Error::Internal(_) => "internal error".to_string(),
                other => other.to_string(),
            };
            Json(JsonRpcResponse::error(
                Some(request.id),
                e.to_rpc_code(),
                message,
            ))
            .into_response()
        }
    }
}
