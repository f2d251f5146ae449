//! Gateway server lifecycle
//!
//! Wires the store, provider, minter, cache, and collaborators into the
//! router, runs the listener (TLS when configured), keeps the scheduler
//! address fresh through the directory reconciler, and drains in-flight
//! requests on shutdown before closing the store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::cluster::remote::{RemoteDirectory, RemoteScheduler};
use crate::cluster::tools::SchedulerToolHost;
use crate::cluster::{DirectoryClient, SchedulerClient, ToolHost};
use crate::config::Config;
use crate::failsafe::AdmissionController;
use crate::oauth::provider::OAuth2Provider;
use crate::oauth::sso::SsoClient;
use crate::oauth::store::OAuth2Store;
use crate::token::{DownstreamMinter, HmacTokenSigner, SessionCache};
use crate::{Error, Result};

/// Default timeout for upstream HTTP calls
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// External collaborators injected into the gateway
pub struct Collaborators {
    /// Scheduler client
    pub scheduler: Arc<dyn SchedulerClient>,
    /// Directory client
    pub directory: Option<Arc<dyn DirectoryClient>>,
    /// Tool host for the JSON-RPC surface
    pub tool_host: Arc<dyn ToolHost>,
    /// Concrete scheduler handle the reconciler updates, when the
    /// scheduler address comes from the directory
    pub reconcilable: Option<Arc<RemoteScheduler>>,
}

/// The gateway server
pub struct Gateway {
    config: Config,
    collaborators: Collaborators,
}

impl Gateway {
    /// Create with explicitly injected collaborators
    #[must_use]
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    /// Create with the HTTP-bridge collaborators built from configuration
    pub fn from_config(config: Config) -> Result<Self> {
        let scheduler =
            RemoteScheduler::new(config.cluster.scheduler_addr.clone(), UPSTREAM_TIMEOUT)?;
        let directory = match &config.cluster.directory_addr {
            Some(addr) => Some(
                RemoteDirectory::new(addr.clone(), UPSTREAM_TIMEOUT)?
                    as Arc<dyn DirectoryClient>,
            ),
            None => None,
        };
        let tool_host: Arc<dyn ToolHost> = Arc::new(SchedulerToolHost::new(Arc::clone(
            &scheduler,
        )
            as Arc<dyn SchedulerClient>));

        let collaborators = Collaborators {
            scheduler: Arc::clone(&scheduler) as Arc<dyn SchedulerClient>,
            directory,
            tool_host,
            reconcilable: Some(scheduler),
        };
        Ok(Self::new(config, collaborators))
    }

    /// Build the shared state (store, provider, minter, cache, limiter).
    /// Returns the store handle separately for the shutdown path.
    pub async fn build_state(
        &self,
        metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
    ) -> Result<(Arc<AppState>, Option<Arc<OAuth2Store>>)> {
        let config = &self.config;

        let (provider, store) = if config.provider.is_configured() {
            let store = Arc::new(OAuth2Store::open(&config.provider.resolve_store_path()).await?);
            let sso = if config.sso.is_configured() {
                let http = reqwest::Client::builder()
                    .timeout(UPSTREAM_TIMEOUT)
                    .build()
                    .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
                Some(Arc::new(SsoClient::new(http, config.sso.clone())))
            } else {
                None
            };
            let provider = Arc::new(
                OAuth2Provider::new(Arc::clone(&store), config.provider.clone(), sso).await?,
            );
            (Some(provider), Some(store))
        } else {
            warn!("issuer-url not set: running without an authorization server");
            (None, None)
        };

        let minter = match &config.downstream.trust_domain {
            Some(trust_domain) => {
                let signer = HmacTokenSigner::from_key_dir(
                    &config.provider.resolve_signing_key_dir(),
                    trust_domain,
                )?;
                Some(Arc::new(DownstreamMinter::new(
                    &config.downstream,
                    Arc::new(signer),
                )?))
            }
            None => {
                warn!("trust-domain not set: downstream tokens will not be minted");
                None
            }
        };

        let read_only_tools = config
            .rpc
            .read_only_tools
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| Error::Config(format!("bad read-only tool pattern {p}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let state = Arc::new(AppState {
            provider,
            minter,
            session_cache: Arc::new(SessionCache::new()),
            admission: Arc::new(AdmissionController::new(&config.rate_limit)),
            scheduler: Arc::clone(&self.collaborators.scheduler),
            directory: self.collaborators.directory.clone(),
            tool_host: Arc::clone(&self.collaborators.tool_host),
            read_only_tools,
            rpc_enabled: config.rpc.enabled,
            sandbox_max_bytes: config.rest.sandbox_max_bytes,
            metrics,
        });
        Ok((state, store))
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let metrics = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Prometheus recorder unavailable");
                None
            }
        };

        let (state, store) = self.build_state(metrics).await?;

        let addr: SocketAddr = self
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen-addr: {e}")))?;

        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

        // Directory reconciler keeps the cached scheduler address fresh
        if let (Some(remote), Some(directory)) = (
            &self.collaborators.reconcilable,
            &self.collaborators.directory,
        ) {
            let remote = Arc::clone(remote);
            let directory = Arc::clone(directory);
            let scheduler_name = self.config.cluster.scheduler_name.clone();
            let interval = self.config.cluster.reconcile_interval;
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match directory.locate_scheduler(scheduler_name.as_deref()).await {
                                Ok(Some(addr)) => remote.set_addr(addr),
                                Ok(None) => {
                                    warn!("Directory advertises no scheduler");
                                }
                                Err(e) => {
                                    warn!(error = %e, "Scheduler address refresh failed");
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        let app = create_router(Arc::clone(&state));

        let handle = axum_server::Handle::new();
        {
            let handle = handle.clone();
            let shutdown_tx = shutdown_tx.clone();
            let grace = self.config.server.shutdown_grace;
            tokio::spawn(async move {
                shutdown_signal().await;
                info!(grace = ?grace, "Shutdown signal received, draining");
                let _ = shutdown_tx.send(());
                handle.graceful_shutdown(Some(grace));
            });
        }

        info!(
            version = env!("CARGO_PKG_VERSION"),
            addr = %addr,
            tls = self.config.server.tls_cert.is_some(),
            provider = state.provider.is_some(),
            rpc = state.rpc_enabled,
            "Gateway listening"
        );

        match (&self.config.server.tls_cert, &self.config.server.tls_key) {
            (Some(cert), Some(key)) => {
                let tls = RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(Error::Io)?;
                axum_server::bind_rustls(addr, tls)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await?;
            }
            _ => {
                axum_server::bind(addr)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await?;
            }
        }

        if let Some(store) = store {
            store.close().await;
        }
        info!("Gateway shutdown complete");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
