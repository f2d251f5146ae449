//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Listener configuration
    pub server: ServerConfig,
    /// Scheduler and directory endpoints
    pub cluster: ClusterConfig,
    /// Embedded OAuth2 provider
    pub provider: ProviderConfig,
    /// SSO delegation to an external IdP
    pub sso: SsoConfig,
    /// Downstream credential minting
    pub downstream: DownstreamConfig,
    /// Admission control
    pub rate_limit: RateLimitConfig,
    /// JSON-RPC tool-call surface
    pub rpc: RpcConfig,
    /// REST job surface
    pub rest: RestConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub listen_addr: String,
    /// TLS certificate chain (PEM); TLS is enabled iff both cert and key are set
    pub tls_cert: Option<PathBuf>,
    /// TLS private key (PEM)
    pub tls_key: Option<PathBuf>,
    /// Drain window for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9680".to_string(),
            tls_cert: None,
            tls_key: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Scheduler / directory endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// Name of the scheduler daemon jobs are routed to
    pub scheduler_name: Option<String>,
    /// Scheduler address; when unset the directory reconciler resolves it
    pub scheduler_addr: Option<String>,
    /// Directory service address
    pub directory_addr: Option<String>,
    /// How often the reconciler refreshes the cached scheduler address
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            scheduler_name: None,
            scheduler_addr: None,
            directory_addr: None,
            reconcile_interval: Duration::from_secs(60),
        }
    }
}

/// User-code rendering for the device flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserCodeFormat {
    /// Uppercase letters and digits
    Alphanumeric,
    /// Digits only
    Numeric,
}

/// Embedded OAuth2 provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProviderConfig {
    /// Issuer URL advertised in metadata and used as the Bearer realm
    pub issuer_url: Option<String>,
    /// SQLite database holding OAuth2 state
    pub store_path: Option<PathBuf>,
    /// Directory holding the RSA signing key (created on first start)
    pub signing_key_dir: Option<PathBuf>,
    /// Trusted reverse-proxy header naming the authenticated user
    pub user_header: Option<String>,
    /// Device flow user-code alphabet
    pub user_code_format: UserCodeFormat,
    /// Device flow user-code length
    pub user_code_length: usize,
    /// Device flow minimum polling interval (seconds)
    pub device_poll_interval: u64,
    /// Device code lifetime
    #[serde(with = "humantime_serde")]
    pub device_code_lifetime: Duration,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_lifetime: Duration,
    /// Authorization code lifetime
    #[serde(with = "humantime_serde")]
    pub auth_code_lifetime: Duration,
    /// Refresh token lifetime, enforced at validation
    #[serde(with = "humantime_serde")]
    pub refresh_token_lifetime: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            issuer_url: None,
            store_path: None,
            signing_key_dir: None,
            user_header: None,
            user_code_format: UserCodeFormat::Alphanumeric,
            user_code_length: 8,
            device_poll_interval: 5,
            device_code_lifetime: Duration::from_secs(600),
            access_token_lifetime: Duration::from_secs(3600),
            auth_code_lifetime: Duration::from_secs(600),
            refresh_token_lifetime: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl ProviderConfig {
    /// True iff the provider is configured as an authorization server
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.issuer_url.is_some()
    }

    /// Database path, defaulting under the user's data dir
    #[must_use]
    pub fn resolve_store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("grid-gateway")
                .join("oauth2.db")
        })
    }

    /// Signing key directory, defaulting under the user's data dir
    #[must_use]
    pub fn resolve_signing_key_dir(&self) -> PathBuf {
        self.signing_key_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("grid-gateway")
                .join("keys")
        })
    }
}

/// SSO delegation configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct SsoConfig {
    /// OAuth2 client id registered at the upstream IdP
    pub client_id: Option<String>,
    /// Client secret (supports `env:VAR_NAME`)
    pub client_secret: Option<String>,
    /// Upstream authorization endpoint
    pub auth_url: Option<String>,
    /// Upstream token endpoint
    pub token_url: Option<String>,
    /// Upstream userinfo endpoint; group claims are fetched from here when set
    pub userinfo_url: Option<String>,
    /// Redirect URL pointing back at this gateway's callback
    pub redirect_url: Option<String>,
    /// Claim carrying group memberships
    pub groups_claim: Option<String>,
    /// Group required to access the gateway at all (empty = no gate)
    pub access_group: Option<String>,
    /// Group granting the read scope
    pub read_group: Option<String>,
    /// Group granting the write scope
    pub write_group: Option<String>,
}

impl SsoConfig {
    /// True iff delegation is configured (authorize redirects upstream)
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.auth_url.is_some() && self.token_url.is_some()
    }

    /// Resolve the client secret (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_client_secret(&self) -> Option<String> {
        self.client_secret.as_ref().map(|secret| {
            if let Some(var_name) = secret.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| secret.clone())
            } else {
                secret.clone()
            }
        })
    }

    /// Groups claim name, defaulting to `groups`
    #[must_use]
    pub fn groups_claim_name(&self) -> &str {
        self.groups_claim.as_deref().unwrap_or("groups")
    }
}

/// Downstream credential configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DownstreamConfig {
    /// Issuer stamped into downstream tokens
    pub trust_domain: Option<String>,
    /// Domain used to qualify bare subjects (`user` -> `user@domain`)
    pub identity_domain: Option<String>,
    /// Include ADVERTISE_* authorizations on `scheduler:/WRITE` grants
    pub advertise_on_write: bool,
    /// Downstream token lifetime
    #[serde(with = "humantime_serde")]
    pub token_lifetime: Duration,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            trust_domain: None,
            identity_domain: None,
            advertise_on_write: false,
            token_lifetime: Duration::from_secs(3600),
        }
    }
}

/// Admission control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Enable admission control
    pub enabled: bool,
    /// Scheduler-query admissions per second per identity
    pub scheduler_query_rate: u32,
    /// Scheduler-query burst per identity
    pub scheduler_query_burst: u32,
    /// Directory-query admissions per second per identity
    pub directory_query_rate: u32,
    /// Directory-query burst per identity
    pub directory_query_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scheduler_query_rate: 10,
            scheduler_query_burst: 20,
            directory_query_rate: 10,
            directory_query_burst: 20,
        }
    }
}

/// JSON-RPC tool-call surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RpcConfig {
    /// Enable the /rpc endpoint
    pub enabled: bool,
    /// Glob patterns naming tools callable with only the read scope
    pub read_only_tools: Vec<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_only_tools: vec!["query_*".to_string(), "get_*".to_string()],
        }
    }
}

/// REST job surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RestConfig {
    /// Maximum accepted sandbox upload size in bytes
    pub sandbox_max_bytes: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            sandbox_max_bytes: 1 << 30,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (GRID_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("GRID_GATEWAY_").split("__"));

        let mut config: Self = figment.extract().map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in endpoint values
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("static pattern");

        let expand = |value: &mut Option<String>| {
            if let Some(v) = value.as_mut() {
                *v = re
                    .replace_all(v, |caps: &regex::Captures<'_>| {
                        env::var(&caps[1]).unwrap_or_else(|_| {
                            caps.get(2).map_or(String::new(), |d| d.as_str().to_string())
                        })
                    })
                    .into_owned();
            }
        };

        expand(&mut self.cluster.scheduler_addr);
        expand(&mut self.cluster.directory_addr);
        expand(&mut self.sso.auth_url);
        expand(&mut self.sso.token_url);
        expand(&mut self.sso.userinfo_url);
        expand(&mut self.sso.redirect_url);
        expand(&mut self.provider.issuer_url);
    }

    /// Reject configurations that cannot start
    fn validate(&self) -> Result<()> {
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(Error::Config(
                "tls-cert and tls-key must be set together".to_string(),
            ));
        }
        if self.sso.is_configured() {
            if !self.provider.is_configured() {
                return Err(Error::Config(
                    "sso-* options require issuer-url (the provider hosts the callback)"
                        .to_string(),
                ));
            }
            if self.sso.redirect_url.is_none() {
                return Err(Error::Config(
                    "sso-redirect-url is required when SSO delegation is configured".to_string(),
                ));
            }
        }
        if self.provider.user_code_length < 4 {
            return Err(Error::Config(
                "user-code-length must be at least 4".to_string(),
            ));
        }
        Ok(())
    }
}
