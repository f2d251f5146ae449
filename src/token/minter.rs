//! Downstream token minting
//!
//! Given a resolved subject and the scopes granted to it, mints a
//! short-lived signed bearer the scheduler accepts as the end-user. The
//! authorization list is derived from the scope set through a closed
//! mapping table; signing is delegated to the [`TokenSigner`] collaborator.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::signer::TokenSigner;
use crate::config::DownstreamConfig;
use crate::{Error, Result};

/// Advertise authorizations optionally implied by `scheduler:/WRITE`
const ADVERTISE_ON_WRITE: [&str; 3] = ["ADVERTISE_MASTER", "ADVERTISE_STARTD", "ADVERTISE_SCHEDD"];

/// Map granted scopes onto the scheduler authorization list.
///
/// The mapping is a closed table; scope names are matched
/// case-insensitively and the result is deduplicated with a stable order,
/// so mapping the same set twice yields the same list.
#[must_use]
pub fn map_scopes(scopes: &[String], advertise_on_write: bool) -> Vec<String> {
    let mut authz: BTreeSet<String> = BTreeSet::new();

    for scope in scopes {
        let lower = scope.to_ascii_lowercase();
        match lower.as_str() {
            "scheduler:/read" | "read" => {
                authz.insert("READ".to_string());
            }
            "scheduler:/write" | "write" => {
                authz.insert("WRITE".to_string());
                authz.insert("READ".to_string());
                if advertise_on_write && lower == "scheduler:/write" {
                    for a in ADVERTISE_ON_WRITE {
                        authz.insert(a.to_string());
                    }
                }
            }
            "scheduler:/administrator" => {
                authz.insert("ADMINISTRATOR".to_string());
                authz.insert("WRITE".to_string());
                authz.insert("READ".to_string());
            }
            "scheduler:/owner" => {
                authz.insert("OWNER".to_string());
                authz.insert("WRITE".to_string());
                authz.insert("READ".to_string());
            }
            "scheduler:/daemon" => {
                authz.insert("DAEMON".to_string());
                authz.insert("READ".to_string());
            }
            "scheduler:/negotiator" => {
                authz.insert("NEGOTIATOR".to_string());
                authz.insert("READ".to_string());
            }
            "scheduler:/config" => {
                authz.insert("CONFIG".to_string());
            }
            _ => {
                // ADVERTISE_* scopes map to themselves, exact
                if let Some(tail) = lower.strip_prefix("scheduler:/advertise_") {
                    authz.insert(format!("ADVERTISE_{}", tail.to_ascii_uppercase()));
                }
            }
        }
    }

    authz.into_iter().collect()
}

/// Mints downstream bearer tokens for the scheduler
pub struct DownstreamMinter {
    signer: Arc<dyn TokenSigner>,
    trust_domain: String,
    identity_domain: Option<String>,
    advertise_on_write: bool,
    lifetime_secs: i64,
}

impl DownstreamMinter {
    /// Build from the downstream configuration and a signer
    pub fn new(config: &DownstreamConfig, signer: Arc<dyn TokenSigner>) -> Result<Self> {
        let trust_domain = config
            .trust_domain
            .clone()
            .ok_or_else(|| Error::Config("trust-domain is required".to_string()))?;
        Ok(Self {
            signer,
            trust_domain,
            identity_domain: config.identity_domain.clone(),
            advertise_on_write: config.advertise_on_write,
            lifetime_secs: i64::try_from(config.token_lifetime.as_secs()).unwrap_or(3600),
        })
    }

    /// Qualify a bare subject with the configured identity domain
    fn qualify(&self, subject: &str) -> Result<String> {
        if subject.contains('@') {
            return Ok(subject.to_string());
        }
        match &self.identity_domain {
            Some(domain) => Ok(format!("{subject}@{domain}")),
            None => Err(Error::Config(
                "identity-domain is required to qualify bare subjects".to_string(),
            )),
        }
    }

    /// Mint a downstream token for `subject` carrying the authorization
    /// list derived from `scopes`
    pub fn mint(&self, subject: &str, scopes: &[String]) -> Result<String> {
        let sub = self.qualify(subject)?;
        let authz = map_scopes(scopes, self.advertise_on_write);
        let now = Utc::now();
        let claims = json!({
            "sub": sub,
            "iss": self.trust_domain,
            "iat": now.timestamp(),
            "exp": now.timestamp() + self.lifetime_secs,
            "scope": authz,
        });
        self.signer.sign(&claims)
    }
}
