//! SSO delegation client
//!
//! When configured, the authorize endpoint hands end-user authentication
//! to an external IdP: the original request parks in a pending table keyed
//! by an opaque state token, the user authenticates upstream, and the
//! callback resumes the authorize flow with a subject and group-derived
//! scopes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    response::Response,
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use rand::RngCore;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::provider::{AuthorizeParams, OAuth2Provider, OAuthFailure, found};
use super::scope;
use super::store::IdentitySession;
use crate::config::SsoConfig;
use crate::error::oauth_codes;
use crate::{Error, Result};

/// Pending authorize requests expire after ten minutes
const PENDING_TTL: Duration = Duration::from_secs(600);

/// Scopes requested from the upstream IdP
const UPSTREAM_SCOPE: &str = "openid profile email";

struct Pending {
    params: AuthorizeParams,
    created_at: Instant,
}

/// Access decision derived from the group claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDecision {
    /// User failed the access gate
    pub denied: bool,
    /// User is in the read group
    pub read: bool,
    /// User is in the write group
    pub write: bool,
}

/// Outbound OAuth2 client for the external IdP
pub struct SsoClient {
    http: reqwest::Client,
    config: SsoConfig,
    client_secret: Option<String>,
    pending: Mutex<HashMap<String, Pending>>,
}

#[derive(Debug, Deserialize)]
struct UpstreamTokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl SsoClient {
    /// Build from configuration; `config.is_configured()` must hold
    #[must_use]
    pub fn new(http: reqwest::Client, config: SsoConfig) -> Self {
        let client_secret = config.resolve_client_secret();
        Self {
            http,
            config,
            client_secret,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn prune_pending(pending: &mut HashMap<String, Pending>) {
        pending.retain(|_, p| p.created_at.elapsed() < PENDING_TTL);
    }

    /// Park the authorize request and build the upstream redirect
    pub fn begin_delegation(&self, params: &AuthorizeParams) -> Result<String> {
        let auth_url = self
            .config
            .auth_url
            .as_deref()
            .ok_or_else(|| Error::Config("sso-auth-url missing".to_string()))?;
        let client_id = self
            .config
            .client_id
            .as_deref()
            .ok_or_else(|| Error::Config("sso-client-id missing".to_string()))?;
        let redirect_url = self
            .config
            .redirect_url
            .as_deref()
            .ok_or_else(|| Error::Config("sso-redirect-url missing".to_string()))?;

        let state = generate_state();
        {
            let mut pending = self.pending.lock();
            Self::prune_pending(&mut pending);
            pending.insert(
                state.clone(),
                Pending {
                    params: params.clone(),
                    created_at: Instant::now(),
                },
            );
        }

        let mut url = Url::parse(auth_url)
            .map_err(|e| Error::Config(format!("invalid sso-auth-url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_url)
            .append_pair("scope", UPSTREAM_SCOPE)
            .append_pair("state", &state);
        debug!(client_id = %params.client_id, "Delegating authorization to upstream IdP");
        Ok(url.to_string())
    }

    /// Retrieve and remove a pending request by state token
    pub fn take_pending(&self, state: &str) -> Option<AuthorizeParams> {
        let mut pending = self.pending.lock();
        Self::prune_pending(&mut pending);
        pending.remove(state).map(|p| p.params)
    }

    /// Number of parked requests (tests)
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Exchange the callback code at the IdP token endpoint
    async fn exchange_code(&self, code: &str) -> Result<UpstreamTokenResponse> {
        let token_url = self
            .config
            .token_url
            .as_deref()
            .ok_or_else(|| Error::Config("sso-token-url missing".to_string()))?;
        let redirect_url = self.config.redirect_url.as_deref().unwrap_or_default();
        let client_id = self.config.client_id.as_deref().unwrap_or_default();

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_url.to_string()),
            ("client_id", client_id.to_string()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("IdP token endpoint: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "IdP token exchange failed: HTTP {status} - {body}"
            )));
        }
        response
            .json::<UpstreamTokenResponse>()
            .await
            .map_err(|e| Error::Upstream(format!("IdP token response: {e}")))
    }

    /// Resolve identity claims: userinfo when configured, otherwise the
    /// ID token payload obtained over the TLS channel to the IdP
    async fn resolve_claims(&self, tokens: &UpstreamTokenResponse) -> Result<Value> {
        if let Some(userinfo_url) = self.config.userinfo_url.as_deref() {
            let response = self
                .http
                .get(userinfo_url)
                .bearer_auth(&tokens.access_token)
                .send()
                .await
                .map_err(|e| Error::Upstream(format!("IdP userinfo: {e}")))?;
            if !response.status().is_success() {
                return Err(Error::Upstream(format!(
                    "IdP userinfo failed: HTTP {}",
                    response.status()
                )));
            }
            return response
                .json::<Value>()
                .await
                .map_err(|e| Error::Upstream(format!("IdP userinfo body: {e}")));
        }
        if let Some(id_token) = &tokens.id_token {
            return decode_jwt_payload(id_token);
        }
        Ok(Value::Object(serde_json::Map::new()))
    }

    /// Evaluate group membership against the configured gates
    #[must_use]
    pub fn evaluate_groups(&self, groups: &[String]) -> GroupDecision {
        let in_group = |wanted: &Option<String>| {
            wanted
                .as_deref()
                .filter(|w| !w.is_empty())
                .map(|w| groups.iter().any(|g| g.eq_ignore_ascii_case(w)))
        };
        GroupDecision {
            denied: in_group(&self.config.access_group) == Some(false),
            read: in_group(&self.config.read_group).unwrap_or(false),
            write: in_group(&self.config.write_group).unwrap_or(false),
        }
    }

    /// Groups claim name from configuration
    #[must_use]
    pub fn groups_claim_name(&self) -> &str {
        self.config.groups_claim_name()
    }
}

/// Decode a JWT payload without signature verification; the transport to
/// the IdP already authenticated the issuer.
fn decode_jwt_payload(token: &str) -> Result<Value> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Upstream("malformed ID token".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Upstream(format!("ID token payload: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Upstream(format!("ID token claims: {e}")))
}

/// Extract the group list from a claim value: a list of strings or a
/// single space-delimited string
#[must_use]
pub fn extract_groups(claims: &Value, claim_name: &str) -> Vec<String> {
    match claims.get(claim_name) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => scope::split_scopes(s),
        _ => Vec::new(),
    }
}

/// Pick the subject out of the resolved claims
fn claim_subject(claims: &Value) -> Option<String> {
    for key in ["sub", "preferred_username", "email"] {
        if let Some(v) = claims.get(key).and_then(Value::as_str) {
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

#[derive(Debug, Deserialize)]
pub(crate) struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// GET /oauth2/callback - resume a parked authorize request
pub(crate) async fn callback_handler(
    State(provider): State<Arc<OAuth2Provider>>,
    Query(params): Query<CallbackParams>,
) -> std::result::Result<Response, OAuthFailure> {
    let sso = provider
        .sso
        .as_ref()
        .ok_or_else(|| OAuthFailure(Error::Protocol("SSO is not configured".to_string())))?;

    let state = params.state.as_deref().ok_or_else(|| {
        OAuthFailure(Error::oauth2(oauth_codes::INVALID_STATE, "state required"))
    })?;
    let original = sso.take_pending(state).ok_or_else(|| {
        OAuthFailure(Error::oauth2(
            oauth_codes::INVALID_STATE,
            "unknown or expired state",
        ))
    })?;
    let client = provider.validate_authorize(&original).await?;

    // Upstream denial propagates straight back to the original client
    if let Some(upstream_error) = params.error.as_deref() {
        warn!(error = %upstream_error, "Upstream IdP returned an error");
        let url = error_redirect(&original, oauth_codes::ACCESS_DENIED)?;
        return Ok(found(&url));
    }
    let code = params.code.as_deref().ok_or_else(|| {
        OAuthFailure(Error::oauth2(oauth_codes::INVALID_REQUEST, "code required"))
    })?;

    let tokens = sso.exchange_code(code).await?;
    let claims = sso.resolve_claims(&tokens).await?;
    let groups = extract_groups(&claims, sso.groups_claim_name());
    let decision = sso.evaluate_groups(&groups);

    if decision.denied {
        info!(groups = ?groups, "Access group gate denied SSO login");
        let url = error_redirect(&original, oauth_codes::ACCESS_DENIED)?;
        return Ok(found(&url));
    }

    let Some(subject) = claim_subject(&claims) else {
        warn!("IdP claims carry no usable subject");
        let url = error_redirect(&original, oauth_codes::ACCESS_DENIED)?;
        return Ok(found(&url));
    };

    // Requested scopes minus scheduler capabilities, which only group
    // membership can grant
    let requested = original
        .scope
        .as_deref()
        .map(scope::split_scopes)
        .unwrap_or_default();
    let mut granted: Vec<String> = scope::grantable(&requested, &client.scopes)
        .into_iter()
        .filter(|s| !scope::grants_read([*s]))
        .map(str::to_string)
        .collect();
    if decision.read {
        granted.push("read".to_string());
    }
    if decision.write {
        granted.push("write".to_string());
    }

    let session = IdentitySession {
        subject: subject.clone(),
        claims,
        id_token_claims: None,
    };
    info!(subject = %subject, read = decision.read, write = decision.write, "SSO login resolved");

    let url = provider
        .complete_authorize(&original, &client, session, granted)
        .await?;
    Ok(found(&url))
}

fn error_redirect(params: &AuthorizeParams, error: &str) -> Result<String> {
    let mut url = Url::parse(&params.redirect_uri)
        .map_err(|e| Error::Protocol(format!("invalid redirect_uri: {e}")))?;
    url.query_pairs_mut().append_pair("error", error);
    if let Some(state) = &params.state {
        url.query_pairs_mut().append_pair("state", state);
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sso_with(access: Option<&str>, read: Option<&str>, write: Option<&str>) -> SsoClient {
        let config = SsoConfig {
            client_id: Some("gw".to_string()),
            client_secret: None,
            auth_url: Some("https://idp.example/authorize".to_string()),
            token_url: Some("https://idp.example/token".to_string()),
            userinfo_url: None,
            redirect_url: Some("https://gw.example/oauth2/callback".to_string()),
            groups_claim: None,
            access_group: access.map(str::to_string),
            read_group: read.map(str::to_string),
            write_group: write.map(str::to_string),
        };
        SsoClient::new(reqwest::Client::new(), config)
    }

    fn authorize_params() -> AuthorizeParams {
        AuthorizeParams {
            response_type: "code".to_string(),
            client_id: "client_a".to_string(),
            redirect_uri: "https://app.example/cb".to_string(),
            scope: Some("openid read".to_string()),
            state: Some("client-state".to_string()),
            code_challenge: None,
            code_challenge_method: None,
            nonce: None,
        }
    }

    #[test]
    fn group_claim_accepts_list_and_string() {
        let list = json!({"groups": ["eng", "ops"]});
        assert_eq!(extract_groups(&list, "groups"), ["eng", "ops"]);

        let spaced = json!({"groups": "eng ops sales"});
        assert_eq!(extract_groups(&spaced, "groups"), ["eng", "ops", "sales"]);

        let missing = json!({"other": 1});
        assert!(extract_groups(&missing, "groups").is_empty());

        let custom = json!({"memberOf": ["x"]});
        assert_eq!(extract_groups(&custom, "memberOf"), ["x"]);
    }

    #[test]
    fn group_matching_is_case_insensitive() {
        let sso = sso_with(Some("eng"), Some("Readers"), None);
        let decision = sso.evaluate_groups(&["ENG".to_string(), "readers".to_string()]);
        assert!(!decision.denied);
        assert!(decision.read);
        assert!(!decision.write);
    }

    #[test]
    fn access_gate_denies_non_members() {
        let sso = sso_with(Some("eng"), None, None);
        let decision = sso.evaluate_groups(&["sales".to_string()]);
        assert!(decision.denied);

        // Empty access group disables only the gate
        let open = sso_with(None, Some("eng"), None);
        let decision = open.evaluate_groups(&["sales".to_string()]);
        assert!(!decision.denied);
        assert!(!decision.read);
    }

    #[test]
    fn pending_roundtrip_and_single_take() {
        let sso = sso_with(None, None, None);
        let url = sso.begin_delegation(&authorize_params()).unwrap();
        assert!(url.starts_with("https://idp.example/authorize?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=gw"));
        assert_eq!(sso.pending_len(), 1);

        let state = Url::parse(&url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.to_string())
            .unwrap();

        let taken = sso.take_pending(&state).unwrap();
        assert_eq!(taken.client_id, "client_a");
        assert!(sso.take_pending(&state).is_none());
    }

    #[test]
    fn unknown_state_yields_nothing() {
        let sso = sso_with(None, None, None);
        assert!(sso.take_pending("bogus").is_none());
    }

    #[test]
    fn subject_preference_order() {
        assert_eq!(
            claim_subject(&json!({"sub": "u1", "email": "a@b"})).as_deref(),
            Some("u1")
        );
        assert_eq!(
            claim_subject(&json!({"preferred_username": "alice"})).as_deref(),
            Some("alice")
        );
        assert_eq!(
            claim_subject(&json!({"email": "a@b.c"})).as_deref(),
            Some("a@b.c")
        );
        assert!(claim_subject(&json!({})).is_none());
    }

    #[test]
    fn jwt_payload_decodes_without_verification() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"alice","groups":["eng"]}"#);
        let token = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.signature");
        let claims = decode_jwt_payload(&token).unwrap();
        assert_eq!(claims["sub"], "alice");
    }
}
