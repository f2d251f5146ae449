//! Grid Gateway Library
//!
//! HTTP gateway fronting a cluster job scheduler and directory service.
//!
//! # Features
//!
//! - **OAuth2 authorization server**: authorize, token, introspect, revoke,
//!   dynamic registration, RFC 8628 device flow, RFC 8414 metadata
//! - **SSO delegation**: end-user authentication handed to an external IdP
//!   with group-claim scope gating
//! - **Downstream credentials**: short-lived signed bearers minted per
//!   request so the scheduler authenticates the end-user
//! - **Two dispatch surfaces**: REST job routes and a JSON-RPC tool-call
//!   endpoint, both gated by granted scopes
//! - **Production ready**: health checks, metrics, rate limiting, graceful
//!   shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod oauth;
pub mod protocol;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
