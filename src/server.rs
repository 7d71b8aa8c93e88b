//! Server assembly and lifecycle.
//!
//! Wires the stores and services into one [`AppState`], mounts the router,
//! spawns the background sweepers (decision cache, challenges, logout
//! deny-list, recovery sessions), and runs until SIGINT/SIGTERM with a
//! graceful drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::apikey::ApiKeyService;
use crate::authz::AuthzService;
use crate::cache::{self, DecisionCache};
use crate::challenge::{self, ChallengeMap};
use crate::config::{Config, TupleStoreMode};
use crate::exchange::TokenExchange;
use crate::http::{AppState, create_router};
use crate::identity::{self, IdentityGateway, IdpVerifier, SessionService};
use crate::kek::{KekBlobStore, KekRegistry, PublicKeyRegistry, RecoveryService, recovery};
use crate::kv::{KvStore, MemoryKvStore};
use crate::tuple;
use crate::{Error, Result};

/// The Tessera server.
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a server from validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Assemble the shared application state from configuration.
    ///
    /// Public so the integration suite can run the full stack in-process
    /// against the embedded backends.
    pub fn build_state(config: &Config) -> Result<Arc<AppState>> {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = tuple::connect(&config.tuple_store, Arc::clone(&kv))?;

        let decision_cache = config
            .cache
            .enabled
            .then(|| Arc::new(DecisionCache::new(Duration::from_secs(config.cache.ttl_secs))));

        let authz = Arc::new(AuthzService::new(
            Arc::clone(&store),
            decision_cache.clone(),
            config.default_tenant.clone(),
        ));

        let sessions = Arc::new(SessionService::new(
            &config.tokens.resolve_secret(),
            Duration::from_secs(config.tokens.session_ttl_secs),
            Duration::from_secs(config.tokens.resource_ttl_secs),
        ));
        let verifier = Arc::new(IdpVerifier::new(config.identity_provider.clone())?);
        let identity = Arc::new(IdentityGateway::new(
            config.identity_provider.clone(),
            Arc::clone(&verifier),
            Arc::clone(&sessions),
        )?);

        let challenges = Arc::new(ChallengeMap::new(Duration::from_secs(
            config.api_keys.challenge_ttl_secs,
        )));
        let default_key_ttl = (config.api_keys.default_key_ttl_secs > 0)
            .then(|| Duration::from_secs(config.api_keys.default_key_ttl_secs));
        let apikeys = Arc::new(ApiKeyService::new(
            Arc::clone(&kv),
            Arc::clone(&challenges),
            default_key_ttl,
        ));

        let exchange = Arc::new(TokenExchange::new(
            Arc::clone(&verifier),
            Arc::clone(&sessions),
            Arc::clone(&authz),
        ));

        let kek_registry = Arc::new(KekRegistry::new(Arc::clone(&kv)));
        let kek_blobs = Arc::new(KekBlobStore::new(
            Arc::clone(&kv),
            Arc::clone(&kek_registry),
        ));
        let pubkeys = Arc::new(PublicKeyRegistry::new(Arc::clone(&kv)));
        let recovery = Arc::new(RecoveryService::new(
            Arc::clone(&kv),
            Arc::clone(&kek_registry),
        ));

        let rate_limiter = AppState::build_rate_limiter(config);

        Ok(Arc::new(AppState {
            config: config.clone(),
            authz,
            identity,
            sessions,
            apikeys,
            exchange,
            kek_registry,
            kek_blobs,
            pubkeys,
            recovery,
            cache: decision_cache,
            rate_limiter,
        }))
    }

    /// Run the server until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the runtime fails
    /// unrecoverably.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Self::build_state(&self.config)?;

        // In local mode the shared store and model are ensured once at
        // startup; per-tenant mode ensures lazily per tenant.
        if self.config.tuple_store.mode == TupleStoreMode::Local {
            if let Err(e) = state.authz.tenant_exists("default").await {
                warn!(error = %e, "Tuple store not reachable at startup; continuing");
            }
        }

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        if let Some(cache) = &state.cache {
            cache::spawn_sweeper(
                Arc::clone(cache),
                Duration::from_secs(self.config.cache.effective_sweep_secs()),
                shutdown_tx.subscribe(),
            );
        }
        challenge::spawn_sweeper(
            state.apikeys.challenges(),
            Duration::from_secs(self.config.api_keys.challenge_sweep_secs),
            shutdown_tx.subscribe(),
        );
        identity::spawn_deny_list_sweeper(
            Arc::clone(&state.sessions),
            Duration::from_secs(self.config.tokens.session_ttl_secs.max(60)),
            shutdown_tx.subscribe(),
        );
        recovery::spawn_sweeper(
            Arc::clone(&state.recovery),
            Duration::from_secs(60),
            shutdown_tx.subscribe(),
        );

        let app = create_router(Arc::clone(&state));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("cannot bind {addr}: {e}")))?;

        info!("============================================================");
        info!("TESSERA v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        info!(
            mode = ?self.config.tuple_store.mode,
            cache = self.config.cache.enabled,
            rate_limit = self.config.rate_limit.enabled,
            default_tenant = %self.config.default_tenant,
            "Subsystems configured"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Shutdown signal handler: SIGINT or SIGTERM, then notify the sweepers.
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
