//! OAuth2 authorization server
//!
//! RFC 6749/7591/8628/8414 endpoints backed by the persistent store.
//! Access tokens are RS256 JWTs keyed in the store by their signature
//! segment; authorization codes and refresh tokens are opaque artifacts
//! keyed by a SHA-256 digest.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::device;
use super::metadata::server_metadata;
use super::scope;
use super::sso::{self, SsoClient};
use super::store::{
    ClientRecord, IdentitySession, OAuth2Store, SessionRecord, new_session_record,
};
use crate::config::ProviderConfig;
use crate::error::oauth_codes;
use crate::token::{RsaTokenSigner, TokenSigner};
use crate::{Error, Result};

/// Device-code grant type URN
pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Parsed authorize request, also persisted in the SSO pending table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeParams {
    /// Response type; only `code` is supported
    pub response_type: String,
    /// Requesting client
    pub client_id: String,
    /// Exact-match redirect target
    pub redirect_uri: String,
    /// Requested scopes, space-delimited
    #[serde(default)]
    pub scope: Option<String>,
    /// Client CSRF state, echoed on the redirect
    #[serde(default)]
    pub state: Option<String>,
    /// PKCE challenge
    #[serde(default)]
    pub code_challenge: Option<String>,
    /// PKCE challenge method (`plain` or `S256`)
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    /// OpenID Connect nonce, echoed into the ID token
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Token endpoint form body
#[derive(Debug, Deserialize)]
pub struct TokenForm {
    grant_type: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    device_code: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
}

/// Introspection outcome handed to the middleware and the endpoint
#[derive(Debug, Clone)]
pub struct IntrospectedToken {
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Owning client
    pub client_id: String,
    /// Subject
    pub subject: String,
    /// Expiration (Unix seconds)
    pub exp: i64,
}

/// Dynamic registration request (RFC 7591)
#[derive(Debug, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default)]
    redirect_uris: Vec<String>,
    #[serde(default)]
    client_name: Option<String>,
    #[serde(default)]
    grant_types: Option<Vec<String>>,
    #[serde(default)]
    response_types: Option<Vec<String>>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    public: bool,
}

/// The embedded authorization server
pub struct OAuth2Provider {
    pub(crate) store: Arc<OAuth2Store>,
    pub(crate) issuer: String,
    pub(crate) signer: Arc<RsaTokenSigner>,
    pub(crate) config: ProviderConfig,
    pub(crate) sso: Option<Arc<SsoClient>>,
}

/// Failure wrapper rendering RFC 6749 error bodies
pub(crate) struct OAuthFailure(pub Error);

impl IntoResponse for OAuthFailure {
    fn into_response(self) -> Response {
        match self.0 {
            Error::OAuth2 { code, description } => (
                self_status(code),
                Json(json!({"error": code, "error_description": description})),
            )
                .into_response(),
            Error::NotFound(d) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": oauth_codes::INVALID_GRANT, "error_description": d})),
            )
                .into_response(),
            Error::Protocol(d) | Error::Conflict(d) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": oauth_codes::INVALID_REQUEST, "error_description": d})),
            )
                .into_response(),
            Error::Upstream(d) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "temporarily_unavailable", "error_description": d})),
            )
                .into_response(),
            Error::UpstreamTimeout(d) => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({"error": "temporarily_unavailable", "error_description": d})),
            )
                .into_response(),
            other => {
                warn!(error = %other, "OAuth2 endpoint failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "server_error"})),
                )
                    .into_response()
            }
        }
    }
}

fn self_status(code: &str) -> StatusCode {
    match code {
        oauth_codes::INVALID_CLIENT => StatusCode::UNAUTHORIZED,
        oauth_codes::ACCESS_DENIED => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl From<Error> for OAuthFailure {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

/// 302 Found redirect, as RFC 6749 flows expect
pub(crate) fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(axum::http::header::LOCATION, location.to_string())],
    )
        .into_response()
}

/// Tokens produced by a successful grant
#[derive(Debug, Serialize)]
pub(crate) struct TokenEnvelope {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
}

/// Generate an opaque artifact: 32 random bytes, base64url
fn generate_opaque(prefix: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{prefix}_{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Signature under which an artifact is stored: the JWT signature segment
/// for compact JWTs, a SHA-256 digest for opaque strings
#[must_use]
pub fn artifact_signature(token: &str) -> String {
    if token.split('.').count() == 3 {
        token.rsplit('.').next().unwrap_or_default().to_string()
    } else {
        hex::encode(Sha256::digest(token.as_bytes()))
    }
}

/// Append `error` (and `state`) to a redirect URI
fn redirect_with_error(redirect_uri: &str, error: &str, state: Option<&str>) -> Result<String> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| Error::Protocol(format!("invalid redirect_uri: {e}")))?;
    url.query_pairs_mut().append_pair("error", error);
    if let Some(s) = state {
        url.query_pairs_mut().append_pair("state", s);
    }
    Ok(url.to_string())
}

impl OAuth2Provider {
    /// Assemble the provider, generating and persisting the RSA signing
    /// key on first startup
    pub async fn new(
        store: Arc<OAuth2Store>,
        config: ProviderConfig,
        sso: Option<Arc<SsoClient>>,
    ) -> Result<Self> {
        let issuer = config
            .issuer_url
            .clone()
            .ok_or_else(|| Error::Config("issuer-url is required".to_string()))?;

        let pem = match store.load_rsa_key().await? {
            Some(pem) => pem,
            None => {
                info!("Generating RSA-2048 signing key (first startup)");
                let pem = crate::token::generate_rsa_pem()?;
                store.save_rsa_key(&pem).await?;
                pem
            }
        };
        let signer = Arc::new(RsaTokenSigner::from_pem(&pem)?);

        Ok(Self {
            store,
            issuer,
            signer,
            config,
            sso,
        })
    }

    /// Issuer URL, used as the Bearer realm
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Router exposing every provider endpoint
    pub fn routes(provider: Arc<Self>) -> Router {
        Router::new()
            .route(
                "/.well-known/oauth-authorization-server",
                get(metadata_handler),
            )
            .route("/oauth2/authorize", get(authorize_handler))
            .route("/oauth2/token", post(token_handler))
            .route("/oauth2/introspect", post(introspect_handler))
            .route("/oauth2/revoke", post(revoke_handler))
            .route("/oauth2/register", post(register_handler))
            .route("/oauth2/device/authorize", post(device::device_authorize_handler))
            .route("/oauth2/device/verify", post(device::device_verify_handler))
            .route("/oauth2/callback", get(sso::callback_handler))
            .with_state(provider)
    }

    // ------------------------------------------------------------------
    // Client authentication
    // ------------------------------------------------------------------

    /// Authenticate a client via `client_secret_basic` or
    /// `client_secret_post`; public clients pass with no secret.
    pub(crate) async fn authenticate_client(
        &self,
        headers: &HeaderMap,
        form_client_id: Option<&str>,
        form_client_secret: Option<&str>,
    ) -> Result<ClientRecord> {
        let (client_id, secret) = if let Some(basic) = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
        {
            let decoded = STANDARD
                .decode(basic)
                .map_err(|_| Error::oauth2(oauth_codes::INVALID_CLIENT, "malformed Basic header"))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| Error::oauth2(oauth_codes::INVALID_CLIENT, "malformed Basic header"))?;
            let (id, secret) = decoded.split_once(':').ok_or_else(|| {
                Error::oauth2(oauth_codes::INVALID_CLIENT, "malformed Basic header")
            })?;
            (id.to_string(), Some(secret.to_string()))
        } else {
            let id = form_client_id
                .ok_or_else(|| Error::oauth2(oauth_codes::INVALID_CLIENT, "client_id required"))?;
            (id.to_string(), form_client_secret.map(str::to_string))
        };

        let client = self
            .store
            .get_client(&client_id)
            .await
            .map_err(|_| Error::oauth2(oauth_codes::INVALID_CLIENT, "unknown client"))?;

        if client.public {
            return Ok(client);
        }

        let hash = client.secret_hash.as_deref().ok_or_else(|| {
            Error::oauth2(oauth_codes::INVALID_CLIENT, "client has no registered secret")
        })?;
        let presented = secret
            .ok_or_else(|| Error::oauth2(oauth_codes::INVALID_CLIENT, "client_secret required"))?;
        let valid = bcrypt::verify(&presented, hash)
            .map_err(|e| Error::Internal(format!("secret verification: {e}")))?;
        if !valid {
            return Err(Error::oauth2(
                oauth_codes::INVALID_CLIENT,
                "client authentication failed",
            ));
        }
        Ok(client)
    }

    // ------------------------------------------------------------------
    // Token issuance
    // ------------------------------------------------------------------

    /// Issue an access token (and optionally refresh + ID tokens), storing
    /// their sessions under `request_id`
    pub(crate) async fn issue_tokens(
        &self,
        client: &ClientRecord,
        request_id: &str,
        requested_scopes: &[String],
        granted_scopes: &[String],
        session: &IdentitySession,
        form: Value,
        with_refresh: bool,
    ) -> Result<TokenEnvelope> {
        let now = Utc::now();
        let expires_in =
            i64::try_from(self.config.access_token_lifetime.as_secs()).unwrap_or(3600);

        let access_claims = json!({
            "iss": self.issuer,
            "sub": session.subject,
            "aud": client.client_id,
            "iat": now.timestamp(),
            "exp": now.timestamp() + expires_in,
            "jti": request_id,
            "client_id": client.client_id,
            "scope": scope::join_scopes(granted_scopes),
        });
        let access_token = self.signer.sign(&access_claims)?;

        let access_record = new_session_record(
            artifact_signature(&access_token),
            request_id.to_string(),
            client.client_id.clone(),
            requested_scopes.to_vec(),
            granted_scopes.to_vec(),
            form.clone(),
            session.clone(),
            Some(ChronoDuration::seconds(expires_in)),
        );
        self.store.create_access_token(&access_record).await?;

        let refresh_token = if with_refresh {
            let token = generate_opaque("rt");
            let record = new_session_record(
                artifact_signature(&token),
                request_id.to_string(),
                client.client_id.clone(),
                requested_scopes.to_vec(),
                granted_scopes.to_vec(),
                form,
                session.clone(),
                None,
            );
            self.store.create_refresh_token(&record).await?;
            Some(token)
        } else {
            None
        };

        let id_token = if granted_scopes.iter().any(|s| s == "openid") {
            let mut claims = json!({
                "iss": self.issuer,
                "sub": session.subject,
                "aud": client.client_id,
                "iat": now.timestamp(),
                "exp": now.timestamp() + expires_in,
            });
            if let Some(extra) = &session.id_token_claims {
                if let (Some(obj), Some(extra)) = (claims.as_object_mut(), extra.as_object()) {
                    for (k, v) in extra {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
            Some(self.signer.sign(&claims)?)
        } else {
            None
        };

        telemetry_metrics::counter!("grid_gateway_tokens_issued_total").increment(1);

        Ok(TokenEnvelope {
            access_token,
            token_type: "Bearer",
            expires_in,
            refresh_token,
            scope: scope::join_scopes(granted_scopes),
            id_token,
        })
    }

    // ------------------------------------------------------------------
    // Authorize flow
    // ------------------------------------------------------------------

    /// Validate an authorize request against its client registration
    pub(crate) async fn validate_authorize(&self, params: &AuthorizeParams) -> Result<ClientRecord> {
        let client = self
            .store
            .get_client(&params.client_id)
            .await
            .map_err(|_| Error::oauth2(oauth_codes::INVALID_CLIENT, "unknown client"))?;
        if !client
            .redirect_uris
            .iter()
            .any(|u| u == &params.redirect_uri)
        {
            return Err(Error::oauth2(
                oauth_codes::INVALID_REQUEST,
                "redirect_uri is not registered",
            ));
        }
        Ok(client)
    }

    /// Issue an authorization code for a resolved identity and build the
    /// final redirect back to the client
    pub(crate) async fn complete_authorize(
        &self,
        params: &AuthorizeParams,
        client: &ClientRecord,
        session: IdentitySession,
        granted_scopes: Vec<String>,
    ) -> Result<String> {
        let code = generate_opaque("ac");
        let requested = params
            .scope
            .as_deref()
            .map(scope::split_scopes)
            .unwrap_or_default();
        let lifetime = i64::try_from(self.config.auth_code_lifetime.as_secs()).unwrap_or(600);

        let record = new_session_record(
            artifact_signature(&code),
            Uuid::new_v4().to_string(),
            client.client_id.clone(),
            requested,
            granted_scopes,
            json!({
                "redirect_uri": params.redirect_uri,
                "code_challenge": params.code_challenge,
                "code_challenge_method": params.code_challenge_method,
                "state": params.state,
                "nonce": params.nonce,
            }),
            session,
            Some(ChronoDuration::seconds(lifetime)),
        );
        self.store.create_authorization_code(&record).await?;

        let mut url = Url::parse(&params.redirect_uri)
            .map_err(|e| Error::Protocol(format!("invalid redirect_uri: {e}")))?;
        url.query_pairs_mut().append_pair("code", &code);
        if let Some(state) = &params.state {
            url.query_pairs_mut().append_pair("state", state);
        }
        debug!(client_id = %client.client_id, subject = %record.subject, "Issued authorization code");
        Ok(url.to_string())
    }

    // ------------------------------------------------------------------
    // Grants
    // ------------------------------------------------------------------

    async fn grant_authorization_code(
        &self,
        client: &ClientRecord,
        form: &TokenForm,
    ) -> Result<TokenEnvelope> {
        let code = form
            .code
            .as_deref()
            .ok_or_else(|| Error::oauth2(oauth_codes::INVALID_REQUEST, "code required"))?;
        let signature = artifact_signature(code);

        let record = self.store.peek_authorization_code(&signature).await?;

        if record.client_id != client.client_id {
            return Err(Error::oauth2(
                oauth_codes::INVALID_GRANT,
                "code was issued to a different client",
            ));
        }

        // Exact redirect_uri match against the stored form
        let bound_redirect = record.form.get("redirect_uri").and_then(Value::as_str);
        if bound_redirect != form.redirect_uri.as_deref() {
            return Err(Error::oauth2(
                oauth_codes::INVALID_GRANT,
                "redirect_uri mismatch",
            ));
        }

        verify_pkce(&record.form, form.code_verifier.as_deref())?;

        self.exchange_code_transactionally(client, &record, &signature)
            .await
    }

    /// Build both token rows and run the single-use exchange transaction
    async fn exchange_code_transactionally(
        &self,
        client: &ClientRecord,
        code_record: &SessionRecord,
        code_signature: &str,
    ) -> Result<TokenEnvelope> {
        let now = Utc::now();
        let expires_in =
            i64::try_from(self.config.access_token_lifetime.as_secs()).unwrap_or(3600);

        let access_claims = json!({
            "iss": self.issuer,
            "sub": code_record.session.subject,
            "aud": client.client_id,
            "iat": now.timestamp(),
            "exp": now.timestamp() + expires_in,
            "jti": code_record.request_id,
            "client_id": client.client_id,
            "scope": scope::join_scopes(&code_record.granted_scopes),
        });
        let access_token = self.signer.sign(&access_claims)?;
        let refresh_token = generate_opaque("rt");

        let access = new_session_record(
            artifact_signature(&access_token),
            code_record.request_id.clone(),
            client.client_id.clone(),
            code_record.requested_scopes.clone(),
            code_record.granted_scopes.clone(),
            code_record.form.clone(),
            code_record.session.clone(),
            Some(ChronoDuration::seconds(expires_in)),
        );
        let refresh = new_session_record(
            artifact_signature(&refresh_token),
            code_record.request_id.clone(),
            client.client_id.clone(),
            code_record.requested_scopes.clone(),
            code_record.granted_scopes.clone(),
            code_record.form.clone(),
            code_record.session.clone(),
            None,
        );

        self.store
            .exchange_authorization_code(code_signature, &access, &refresh)
            .await?;

        let id_token = if code_record.granted_scopes.iter().any(|s| s == "openid") {
            let mut claims = json!({
                "iss": self.issuer,
                "sub": code_record.session.subject,
                "aud": client.client_id,
                "iat": now.timestamp(),
                "exp": now.timestamp() + expires_in,
            });
            if let Some(nonce) = code_record.form.get("nonce").and_then(Value::as_str) {
                claims["nonce"] = json!(nonce);
            }
            Some(self.signer.sign(&claims)?)
        } else {
            None
        };

        telemetry_metrics::counter!("grid_gateway_tokens_issued_total").increment(1);

        Ok(TokenEnvelope {
            access_token,
            token_type: "Bearer",
            expires_in,
            refresh_token: Some(refresh_token),
            scope: scope::join_scopes(&code_record.granted_scopes),
            id_token,
        })
    }

    async fn grant_refresh_token(
        &self,
        client: &ClientRecord,
        form: &TokenForm,
    ) -> Result<TokenEnvelope> {
        let token = form
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::oauth2(oauth_codes::INVALID_REQUEST, "refresh_token required"))?;
        let record = self
            .store
            .get_refresh_token(&artifact_signature(token))
            .await
            .map_err(|e| match e {
                Error::NotFound(_) | Error::InactiveToken(_) => {
                    Error::oauth2(oauth_codes::INVALID_GRANT, "refresh token is not valid")
                }
                other => other,
            })?;

        if record.client_id != client.client_id {
            return Err(Error::oauth2(
                oauth_codes::INVALID_GRANT,
                "refresh token was issued to a different client",
            ));
        }

        // No stored expiration; the 7-day lifetime is enforced here
        let lifetime = ChronoDuration::seconds(
            i64::try_from(self.config.refresh_token_lifetime.as_secs()).unwrap_or(604_800),
        );
        if record.requested_at + lifetime <= Utc::now() {
            return Err(Error::oauth2(
                oauth_codes::INVALID_GRANT,
                "refresh token expired",
            ));
        }

        // Optional scope narrowing
        let granted = match form.scope.as_deref() {
            Some(requested) => {
                let narrowed = scope::split_scopes(requested);
                if narrowed.iter().any(|s| {
                    !scope::any_scope_covers(
                        record.granted_scopes.iter().map(String::as_str),
                        s,
                    )
                }) {
                    return Err(Error::oauth2(
                        oauth_codes::INVALID_SCOPE,
                        "scope exceeds the original grant",
                    ));
                }
                narrowed
            }
            None => record.granted_scopes.clone(),
        };

        self.issue_tokens(
            client,
            &record.request_id,
            &record.requested_scopes,
            &granted,
            &record.session,
            record.form.clone(),
            false,
        )
        .await
        .map(|mut envelope| {
            envelope.refresh_token = Some(token.to_string());
            envelope
        })
    }

    async fn grant_client_credentials(
        &self,
        client: &ClientRecord,
        form: &TokenForm,
    ) -> Result<TokenEnvelope> {
        if client.public {
            return Err(Error::oauth2(
                oauth_codes::UNAUTHORIZED_CLIENT,
                "public clients cannot use client_credentials",
            ));
        }
        let requested = form
            .scope
            .as_deref()
            .map(scope::split_scopes)
            .unwrap_or_else(|| client.scopes.clone());
        let granted: Vec<String> = scope::grantable(&requested, &client.scopes)
            .into_iter()
            .map(str::to_string)
            .collect();
        if granted.is_empty() && !requested.is_empty() {
            return Err(Error::oauth2(
                oauth_codes::INVALID_SCOPE,
                "no requested scope is allowed for this client",
            ));
        }

        let session = IdentitySession {
            subject: client.client_id.clone(),
            claims: Value::Null,
            id_token_claims: None,
        };
        self.issue_tokens(
            client,
            &Uuid::new_v4().to_string(),
            &requested,
            &granted,
            &session,
            json!({}),
            false,
        )
        .await
    }

    async fn grant_device_code(
        &self,
        client: &ClientRecord,
        form: &TokenForm,
    ) -> Result<TokenEnvelope> {
        let device_code = form.device_code.as_deref().ok_or_else(|| {
            Error::oauth2(oauth_codes::INVALID_REQUEST, "device_code required")
        })?;
        let record = device::poll_device(self, client, device_code).await?;

        let session = record.session.unwrap_or_else(|| IdentitySession {
            subject: record.subject.clone().unwrap_or_default(),
            claims: Value::Null,
            id_token_claims: None,
        });
        let granted: Vec<String> = scope::grantable(&record.scopes, &client.scopes)
            .into_iter()
            .map(str::to_string)
            .collect();

        self.issue_tokens(
            client,
            &Uuid::new_v4().to_string(),
            &record.scopes,
            &granted,
            &session,
            json!({"device_code": true}),
            true,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Introspection / revocation
    // ------------------------------------------------------------------

    /// Introspect a presented token; `None` means inactive for any reason
    pub async fn introspect_token(&self, token: &str) -> Option<IntrospectedToken> {
        let signature = artifact_signature(token);
        let now = Utc::now();

        if let Ok(record) = self.store.get_access_token(&signature).await {
            if record.is_expired(now) {
                return None;
            }
            let exp = record.expires_at.map_or(0, |e| e.timestamp());
            return Some(IntrospectedToken {
                scopes: record.granted_scopes,
                client_id: record.client_id,
                subject: record.subject,
                exp,
            });
        }

        if let Ok(record) = self.store.get_refresh_token(&signature).await {
            let lifetime = ChronoDuration::seconds(
                i64::try_from(self.config.refresh_token_lifetime.as_secs()).unwrap_or(604_800),
            );
            let exp = record.requested_at + lifetime;
            if exp <= now {
                return None;
            }
            return Some(IntrospectedToken {
                scopes: record.granted_scopes,
                client_id: record.client_id,
                subject: record.subject,
                exp: exp.timestamp(),
            });
        }

        None
    }

    /// Revoke by token value; idempotent across both token tables
    pub async fn revoke_token(&self, token: &str) -> Result<()> {
        let signature = artifact_signature(token);
        self.store.revoke_access_token(&signature).await?;
        self.store.revoke_refresh_token(&signature).await?;
        Ok(())
    }

    /// Register a client dynamically, returning its id and one-time secret
    pub async fn register_client(
        &self,
        request: &RegistrationRequest,
    ) -> Result<(ClientRecord, String)> {
        if request.redirect_uris.is_empty() {
            return Err(Error::oauth2(
                oauth_codes::INVALID_REQUEST,
                "at least one redirect URI is required",
            ));
        }

        let client_id = format!(
            "client_{}",
            Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_else(|| Utc::now().timestamp())
        );
        let secret = generate_client_secret();
        let secret_hash = bcrypt::hash(&secret, bcrypt::DEFAULT_COST)
            .map_err(|e| Error::Internal(format!("secret hashing: {e}")))?;

        let record = ClientRecord {
            client_id,
            secret_hash: Some(secret_hash),
            redirect_uris: request.redirect_uris.clone(),
            grant_types: request.grant_types.clone().unwrap_or_else(|| {
                vec!["authorization_code".to_string(), "refresh_token".to_string()]
            }),
            response_types: request
                .response_types
                .clone()
                .unwrap_or_else(|| vec!["code".to_string()]),
            scopes: request
                .scope
                .as_deref()
                .map(scope::split_scopes)
                .unwrap_or_else(|| {
                    vec!["openid".to_string(), "read".to_string(), "write".to_string()]
                }),
            public: request.public,
            name: request.client_name.clone().unwrap_or_default(),
        };
        self.store.create_client(&record).await?;
        Ok((record, secret))
    }
}

/// 32-character random client secret
fn generate_client_secret() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % ALPHABET.len();
            char::from(ALPHABET[idx])
        })
        .collect()
}

/// PKCE verification against the challenge bound to the code
fn verify_pkce(form: &Value, verifier: Option<&str>) -> Result<()> {
    let challenge = form.get("code_challenge").and_then(Value::as_str);
    let Some(challenge) = challenge else {
        return Ok(());
    };
    let verifier = verifier.ok_or_else(|| {
        Error::oauth2(oauth_codes::INVALID_GRANT, "code_verifier required")
    })?;
    let method = form
        .get("code_challenge_method")
        .and_then(Value::as_str)
        .unwrap_or("plain");
    let matches = match method {
        "S256" => {
            let digest = Sha256::digest(verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(digest) == challenge
        }
        _ => verifier == challenge,
    };
    if matches {
        Ok(())
    } else {
        Err(Error::oauth2(
            oauth_codes::INVALID_GRANT,
            "PKCE verification failed",
        ))
    }
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

async fn metadata_handler(State(provider): State<Arc<OAuth2Provider>>) -> Json<Value> {
    Json(server_metadata(provider.issuer()))
}

async fn authorize_handler(
    State(provider): State<Arc<OAuth2Provider>>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> std::result::Result<Response, OAuthFailure> {
    let client = provider.validate_authorize(&params).await?;

    if params.response_type != "code" {
        let url = redirect_with_error(
            &params.redirect_uri,
            "unsupported_response_type",
            params.state.as_deref(),
        )?;
        return Ok(found(&url));
    }

    // (a) trusted reverse-proxy header naming the user
    let proxy_user = provider
        .config
        .user_header
        .as_deref()
        .and_then(|name| headers.get(name))
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    if let Some(subject) = proxy_user {
        let requested = params
            .scope
            .as_deref()
            .map(scope::split_scopes)
            .unwrap_or_default();
        let granted: Vec<String> = scope::grantable(&requested, &client.scopes)
            .into_iter()
            .map(str::to_string)
            .collect();
        let session = IdentitySession {
            subject,
            claims: Value::Null,
            id_token_claims: None,
        };
        let url = provider
            .complete_authorize(&params, &client, session, granted)
            .await?;
        return Ok(found(&url));
    }

    // (b) delegate to the upstream IdP
    if let Some(sso) = &provider.sso {
        let url = sso.begin_delegation(&params)?;
        return Ok(found(&url));
    }

    // No authentication source at all
    let url = redirect_with_error(
        &params.redirect_uri,
        oauth_codes::ACCESS_DENIED,
        params.state.as_deref(),
    )?;
    Ok(found(&url))
}

async fn token_handler(
    State(provider): State<Arc<OAuth2Provider>>,
    headers: HeaderMap,
    axum::extract::Form(form): axum::extract::Form<TokenForm>,
) -> std::result::Result<Json<Value>, OAuthFailure> {
    let client = provider
        .authenticate_client(
            &headers,
            form.client_id.as_deref(),
            form.client_secret.as_deref(),
        )
        .await?;

    if !client.allows_grant(&form.grant_type)
        && !(form.grant_type == DEVICE_GRANT_TYPE && client.allows_grant("device_code"))
    {
        return Err(OAuthFailure(Error::oauth2(
            oauth_codes::UNAUTHORIZED_CLIENT,
            "client is not authorized for this grant type",
        )));
    }

    let envelope = match form.grant_type.as_str() {
        "authorization_code" => provider.grant_authorization_code(&client, &form).await?,
        "refresh_token" => provider.grant_refresh_token(&client, &form).await?,
        "client_credentials" => provider.grant_client_credentials(&client, &form).await?,
        DEVICE_GRANT_TYPE => provider.grant_device_code(&client, &form).await?,
        _ => {
            return Err(OAuthFailure(Error::oauth2(
                oauth_codes::UNSUPPORTED_GRANT_TYPE,
                format!("grant type {} is not supported", form.grant_type),
            )));
        }
    };

    Ok(Json(serde_json::to_value(envelope).map_err(Error::from)?))
}

#[derive(Debug, Deserialize)]
struct IntrospectForm {
    token: String,
}

async fn introspect_handler(
    State(provider): State<Arc<OAuth2Provider>>,
    axum::extract::Form(form): axum::extract::Form<IntrospectForm>,
) -> Json<Value> {
    telemetry_metrics::counter!("grid_gateway_introspections_total").increment(1);
    match provider.introspect_token(&form.token).await {
        Some(info) => Json(json!({
            "active": true,
            "scope": scope::join_scopes(&info.scopes),
            "client_id": info.client_id,
            "sub": info.subject,
            "exp": info.exp,
        })),
        None => Json(json!({"active": false})),
    }
}

#[derive(Debug, Deserialize)]
struct RevokeForm {
    token: String,
}

async fn revoke_handler(
    State(provider): State<Arc<OAuth2Provider>>,
    axum::extract::Form(form): axum::extract::Form<RevokeForm>,
) -> std::result::Result<StatusCode, OAuthFailure> {
    provider.revoke_token(&form.token).await?;
    Ok(StatusCode::OK)
}

async fn register_handler(
    State(provider): State<Arc<OAuth2Provider>>,
    Json(request): Json<RegistrationRequest>,
) -> std::result::Result<(StatusCode, Json<Value>), OAuthFailure> {
    let (client, secret) = provider.register_client(&request).await?;
    info!(client_id = %client.client_id, "Dynamic client registration");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "client_id": client.client_id,
            "client_secret": secret,
            "redirect_uris": client.redirect_uris,
            "grant_types": client.grant_types,
            "response_types": client.response_types,
            "scope": scope::join_scopes(&client.scopes),
            "client_name": client.name,
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_signature_distinguishes_jwt_and_opaque() {
        let jwt = "aaa.bbb.ccc";
        assert_eq!(artifact_signature(jwt), "ccc");

        let opaque = "rt_abc123";
        let sig = artifact_signature(opaque);
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, artifact_signature(opaque));
        assert_ne!(sig, artifact_signature("rt_other"));
    }

    #[test]
    fn opaque_artifacts_have_enough_entropy() {
        let code = generate_opaque("ac");
        assert!(code.starts_with("ac_"));
        // 32 bytes -> 43 base64url chars
        assert!(code.len() >= 45);
        assert_ne!(generate_opaque("ac"), generate_opaque("ac"));
    }

    #[test]
    fn client_secret_is_32_chars() {
        let secret = generate_client_secret();
        assert_eq!(secret.len(), 32);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn pkce_s256_roundtrip() {
        let verifier = "some-code-verifier-string-0123456789abc";
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        let form = json!({
            "code_challenge": challenge,
            "code_challenge_method": "S256",
        });
        assert!(verify_pkce(&form, Some(verifier)).is_ok());
        assert!(verify_pkce(&form, Some("wrong")).is_err());
        assert!(verify_pkce(&form, None).is_err());
    }

    #[test]
    fn pkce_plain_and_absent() {
        let form = json!({"code_challenge": "plain-value", "code_challenge_method": "plain"});
        assert!(verify_pkce(&form, Some("plain-value")).is_ok());
        assert!(verify_pkce(&form, Some("other")).is_err());

        // No challenge bound: verifier not required
        assert!(verify_pkce(&json!({}), None).is_ok());
    }

    #[test]
    fn error_redirect_carries_state() {
        let url =
            redirect_with_error("https://app.example/cb", "access_denied", Some("xyz")).unwrap();
        assert!(url.contains("error=access_denied"));
        assert!(url.contains("state=xyz"));
    }
}
