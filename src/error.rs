//! Error types for the gateway

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed request body or missing field
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Missing, invalid, or expired bearer credential
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Valid credential but insufficient scope
    #[error("Insufficient scope: {0}")]
    InsufficientScope(String),

    /// Job, ad, device code, or client not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Token or code exists but has been revoked or consumed
    #[error("Inactive token: {0}")]
    InactiveToken(String),

    /// Scheduler reports wrong status, code already consumed, etc.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Admission denied by the rate limiter; retry hint in seconds
    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited {
        /// Suggested wait before retrying
        retry_after: u64,
    },

    /// Upstream (scheduler/directory/IdP) reachable but errored
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream timed out
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// OAuth2 protocol error (RFC 6749 / RFC 8628 error code)
    #[error("OAuth2 error {code}: {description}")]
    OAuth2 {
        /// RFC error code, e.g. `invalid_grant`
        code: &'static str,
        /// Human-readable description
        description: String,
    },

    /// JSON-RPC error
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Outbound HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error; detail is logged, never returned to the client
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an OAuth2 protocol error with an RFC error code
    pub fn oauth2(code: &'static str, description: impl Into<String>) -> Self {
        Self::OAuth2 {
            code,
            description: description.into(),
        }
    }

    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
        }
    }

    /// HTTP status this error surfaces as
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Protocol(_) | Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::Authentication(_) | Self::InactiveToken(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::OAuth2 { code, .. } => match *code {
                oauth_codes::INVALID_CLIENT => StatusCode::UNAUTHORIZED,
                oauth_codes::ACCESS_DENIED => StatusCode::FORBIDDEN,
                _ => StatusCode::BAD_REQUEST,
            },
            Self::JsonRpc { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert to a JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::InsufficientScope(_) => rpc_codes::INSUFFICIENT_SCOPE,
            Self::Upstream(_) | Self::UpstreamTimeout(_) => rpc_codes::SERVER_ERROR_START,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// RFC 6749 / RFC 8628 error codes used across the provider
pub mod oauth_codes {
    /// The request is missing a parameter or is otherwise malformed
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// The grant (code, refresh token, device code) is invalid or consumed
    pub const INVALID_GRANT: &str = "invalid_grant";
    /// Client authentication failed
    pub const INVALID_CLIENT: &str = "invalid_client";
    /// The client is not authorized for this grant type
    pub const UNAUTHORIZED_CLIENT: &str = "unauthorized_client";
    /// The grant type is not supported by this server
    pub const UNSUPPORTED_GRANT_TYPE: &str = "unsupported_grant_type";
    /// The requested scope exceeds what the client may be granted
    pub const INVALID_SCOPE: &str = "invalid_scope";
    /// The resource owner or server denied the request
    pub const ACCESS_DENIED: &str = "access_denied";
    /// Device flow: user has not yet approved or denied (RFC 8628)
    pub const AUTHORIZATION_PENDING: &str = "authorization_pending";
    /// Device flow: client is polling faster than the minimum interval
    pub const SLOW_DOWN: &str = "slow_down";
    /// Device flow: the device code has expired
    pub const EXPIRED_TOKEN: &str = "expired_token";
    /// SSO callback state is unknown or expired
    pub const INVALID_STATE: &str = "invalid_state";
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Insufficient scope for the requested method or tool
    pub const INSUFFICIENT_SCOPE: i32 = -32000;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_status() {
        assert_eq!(
            Error::Protocol("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Authentication("no bearer".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::InsufficientScope("write".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::NotFound("job".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::RateLimited { retry_after: 2 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::Upstream("sched".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::UpstreamTimeout("sched".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn oauth_error_status_follows_rfc() {
        assert_eq!(
            Error::oauth2(oauth_codes::INVALID_CLIENT, "bad secret").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::oauth2(oauth_codes::INVALID_GRANT, "consumed").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::oauth2(oauth_codes::AUTHORIZATION_PENDING, "pending").status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn insufficient_scope_rpc_code() {
        let err = Error::InsufficientScope("tools/call".into());
        assert_eq!(err.to_rpc_code(), rpc_codes::INSUFFICIENT_SCOPE);
    }
}
