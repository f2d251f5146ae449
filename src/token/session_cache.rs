//! Identity/session cache
//!
//! Binds validated downstream tokens to reusable cryptographic session
//! containers so repeated scheduler operations by the same identity skip
//! the full handshake. Every entry owns exactly one eviction timer firing
//! at the token's expiration; `remove` always cancels the timer before
//! deleting, and re-adding an unexpired token returns the existing entry
//! without starting a second timer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

/// Opaque cryptographic session container shared across scheduler
/// connections for one identity. The wire-level state lives in the
/// scheduler client; the gateway only keys and reuses it.
#[derive(Debug)]
pub struct SessionHandle {
    /// Container identity
    pub id: Uuid,
    /// When the container was established
    pub created_at: DateTime<Utc>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }
}

/// A cached identity entry
#[derive(Debug)]
pub struct SessionEntry {
    /// Subject extracted from the token claims
    pub subject: String,
    /// Absolute expiration extracted from the token claims
    pub expires_at: DateTime<Utc>,
    /// Reusable session container
    pub session: Arc<SessionHandle>,
}

impl SessionEntry {
    /// True iff the entry's token has expired
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

struct CacheSlot {
    entry: Arc<SessionEntry>,
    timer: AbortHandle,
}

/// Claims the cache needs; the signature was verified when the token was
/// minted or presented, so parsing skips verification here.
#[derive(Debug, Deserialize)]
struct CachedClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

fn parse_claims(token: &str) -> Result<CachedClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = jsonwebtoken::decode::<CachedClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| Error::Authentication(format!("unparseable downstream token: {e}")))?;
    Ok(data.claims)
}

/// Thread-safe per-identity token cache with timer-driven eviction
#[derive(Default)]
pub struct SessionCache {
    inner: Arc<RwLock<HashMap<String, CacheSlot>>>,
}

impl SessionCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a validated downstream token, returning its entry.
    ///
    /// Rejects tokens missing a subject or expiration, or already expired.
    /// Adding a token that is already cached and unexpired returns the
    /// existing entry without touching its timer.
    pub fn add(&self, token: &str) -> Result<Arc<SessionEntry>> {
        let claims = parse_claims(token)?;
        let subject = claims
            .sub
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Authentication("downstream token missing subject".to_string()))?;
        let exp = claims
            .exp
            .ok_or_else(|| Error::Authentication("downstream token missing expiration".to_string()))?;
        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| Error::Authentication("downstream token expiration out of range".to_string()))?;
        let now = Utc::now();
        if expires_at <= now {
            return Err(Error::Authentication("downstream token expired".to_string()));
        }

        let mut map = self.inner.write();

        if let Some(slot) = map.get(token) {
            if !slot.entry.is_expired() {
                return Ok(Arc::clone(&slot.entry));
            }
        }
        // Expired but the timer has not fired yet; replace the slot.
        if let Some(stale) = map.remove(token) {
            stale.timer.abort();
        }

        let entry = Arc::new(SessionEntry {
            subject,
            expires_at,
            session: Arc::new(SessionHandle::new()),
        });

        let ttl = (expires_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let inner = Arc::clone(&self.inner);
        let key = token.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if inner.write().remove(&key).is_some() {
                debug!("Evicted expired identity cache entry");
            }
        })
        .abort_handle();

        map.insert(
            token.to_string(),
            CacheSlot {
                entry: Arc::clone(&entry),
                timer,
            },
        );
        Ok(entry)
    }

    /// Look up an entry; expired-on-read entries are treated as absent
    /// (the timer performs the actual sweep)
    #[must_use]
    pub fn get(&self, token: &str) -> Option<Arc<SessionEntry>> {
        let map = self.inner.read();
        map.get(token)
            .filter(|slot| !slot.entry.is_expired())
            .map(|slot| Arc::clone(&slot.entry))
    }

    /// Cancel the entry's timer and delete it; idempotent
    pub fn remove(&self, token: &str) {
        if let Some(slot) = self.inner.write().remove(token) {
            slot.timer.abort();
        }
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True iff the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
