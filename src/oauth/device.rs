//! RFC 8628 device authorization flow
//!
//! A device obtains a long opaque device code plus a short user code; the
//! user approves or denies the user code out of band, and the device polls
//! the token endpoint, observing `authorization_pending`, `slow_down`,
//! `access_denied`, or `expired_token` until tokens are issued exactly once.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::provider::{OAuth2Provider, OAuthFailure};
use super::scope;
use super::store::{DeviceRecord, DeviceState, IdentitySession};
use crate::config::UserCodeFormat;
use crate::error::oauth_codes;
use crate::{Error, Result};

/// Generate the long opaque device code (32 random bytes, base64url)
fn generate_device_code() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a short user code in the configured alphabet
fn generate_user_code(format: UserCodeFormat, length: usize) -> String {
    const ALPHANUMERIC: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    const NUMERIC: &[u8] = b"0123456789";
    let alphabet = match format {
        UserCodeFormat::Alphanumeric => ALPHANUMERIC,
        UserCodeFormat::Numeric => NUMERIC,
    };
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(alphabet[rng.gen_range(0..alphabet.len())]))
        .collect()
}

/// Resolve a device poll at the token endpoint into an approved,
/// consumable record, or the applicable RFC 8628 error.
pub(crate) async fn poll_device(
    provider: &OAuth2Provider,
    client: &super::store::ClientRecord,
    device_code: &str,
) -> Result<DeviceRecord> {
    let record = provider
        .store
        .get_device_code(device_code)
        .await
        .map_err(|_| Error::oauth2(oauth_codes::INVALID_GRANT, "unknown device code"))?;

    if record.client_id != client.client_id {
        return Err(Error::oauth2(
            oauth_codes::INVALID_GRANT,
            "device code was issued to a different client",
        ));
    }

    let now = Utc::now();
    if record.state == DeviceState::Pending && record.expires_at <= now {
        provider.store.expire_device(device_code).await?;
        return Err(Error::oauth2(
            oauth_codes::EXPIRED_TOKEN,
            "device code expired",
        ));
    }

    let previous_poll = provider.store.touch_device_poll(device_code, now).await?;

    match record.state {
        DeviceState::Pending => {
            let violated = previous_poll.is_some_and(|prev| {
                now - prev < ChronoDuration::seconds(record.poll_interval)
            });
            if violated {
                Err(Error::oauth2(
                    oauth_codes::SLOW_DOWN,
                    "polling faster than the minimum interval",
                ))
            } else {
                Err(Error::oauth2(
                    oauth_codes::AUTHORIZATION_PENDING,
                    "awaiting user approval",
                ))
            }
        }
        DeviceState::Approved => provider.store.consume_device(device_code).await,
        DeviceState::Denied => Err(Error::oauth2(
            oauth_codes::ACCESS_DENIED,
            "device authorization denied",
        )),
        DeviceState::Consumed => Err(Error::oauth2(
            oauth_codes::INVALID_GRANT,
            "device code already consumed",
        )),
        DeviceState::Expired => Err(Error::oauth2(
            oauth_codes::EXPIRED_TOKEN,
            "device code expired",
        )),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeviceAuthorizeForm {
    client_id: String,
    #[serde(default)]
    scope: Option<String>,
}

/// POST /oauth2/device/authorize
pub(crate) async fn device_authorize_handler(
    State(provider): State<Arc<OAuth2Provider>>,
    axum::extract::Form(form): axum::extract::Form<DeviceAuthorizeForm>,
) -> std::result::Result<Json<Value>, OAuthFailure> {
    let client = provider
        .store
        .get_client(&form.client_id)
        .await
        .map_err(|_| Error::oauth2(oauth_codes::INVALID_CLIENT, "unknown client"))?;

    let scopes = form
        .scope
        .as_deref()
        .map(scope::split_scopes)
        .unwrap_or_default();

    let now = Utc::now();
    let expires_in =
        i64::try_from(provider.config.device_code_lifetime.as_secs()).unwrap_or(600);
    let interval = i64::try_from(provider.config.device_poll_interval).unwrap_or(5);

    let record = DeviceRecord {
        device_code: generate_device_code(),
        user_code: generate_user_code(
            provider.config.user_code_format,
            provider.config.user_code_length,
        ),
        client_id: client.client_id.clone(),
        scopes,
        created_at: now,
        expires_at: now + ChronoDuration::seconds(expires_in),
        state: DeviceState::Pending,
        subject: None,
        session: None,
        poll_interval: interval,
        last_poll: None,
    };
    provider.store.create_device_code(&record).await?;

    let issuer = provider.issuer().trim_end_matches('/');
    let verification_uri = format!("{issuer}/oauth2/device/verify");
    info!(client_id = %client.client_id, user_code = %record.user_code, "Device authorization started");

    Ok(Json(json!({
        "device_code": record.device_code,
        "user_code": record.user_code,
        "verification_uri": verification_uri,
        "verification_uri_complete": format!("{verification_uri}?user_code={}", record.user_code),
        "expires_in": expires_in,
        "interval": interval,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeviceVerifyForm {
    user_code: String,
    action: String,
    #[serde(default)]
    username: Option<String>,
}

/// POST /oauth2/device/verify
pub(crate) async fn device_verify_handler(
    State(provider): State<Arc<OAuth2Provider>>,
    axum::extract::Form(form): axum::extract::Form<DeviceVerifyForm>,
) -> std::result::Result<(StatusCode, Json<Value>), OAuthFailure> {
    let user_code = form.user_code.trim().to_ascii_uppercase();
    let record = provider
        .store
        .find_device_by_user_code(&user_code)
        .await
        .map_err(|_| Error::NotFound("user code".to_string()))
        .map_err(OAuthFailure)?;

    if record.expires_at <= Utc::now() {
        provider.store.expire_device(&record.device_code).await?;
        return Err(OAuthFailure(Error::oauth2(
            oauth_codes::EXPIRED_TOKEN,
            "user code expired",
        )));
    }

    match form.action.as_str() {
        "approve" => {
            let username = form
                .username
                .as_deref()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| {
                    OAuthFailure(Error::oauth2(
                        oauth_codes::INVALID_REQUEST,
                        "username is required to approve",
                    ))
                })?;
            let session = IdentitySession {
                subject: username.to_string(),
                claims: Value::Null,
                id_token_claims: None,
            };
            provider
                .store
                .approve_device(&user_code, username, &session)
                .await
                .map_err(OAuthFailure)?;
            info!(user_code = %user_code, subject = %username, "Device authorization approved");
            Ok((StatusCode::OK, Json(json!({"status": "approved"}))))
        }
        "deny" => {
            provider
                .store
                .deny_device(&user_code)
                .await
                .map_err(OAuthFailure)?;
            info!(user_code = %user_code, "Device authorization denied");
            Ok((StatusCode::OK, Json(json!({"status": "denied"}))))
        }
        other => Err(OAuthFailure(Error::oauth2(
            oauth_codes::INVALID_REQUEST,
            format!("unknown action {other}"),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_code_has_required_entropy() {
        let code = generate_device_code();
        // 32 bytes of entropy, well past the 128-bit recommendation
        assert!(code.len() >= 22);
        assert_ne!(generate_device_code(), generate_device_code());
    }

    #[test]
    fn user_code_respects_format_and_length() {
        let alnum = generate_user_code(UserCodeFormat::Alphanumeric, 8);
        assert_eq!(alnum.len(), 8);
        assert!(alnum.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        let numeric = generate_user_code(UserCodeFormat::Numeric, 6);
        assert_eq!(numeric.len(), 6);
        assert!(numeric.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn user_codes_are_not_repeated() {
        let a = generate_user_code(UserCodeFormat::Alphanumeric, 8);
        let b = generate_user_code(UserCodeFormat::Alphanumeric, 8);
        assert_ne!(a, b);
    }
}
