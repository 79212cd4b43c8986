//! Application startup and lifecycle management.

use crate::config::GatewayConfig;
use crate::services::{
    Clock, CredentialManager, GatewayPolicy, GatewayService, HttpResponder, InMemoryUsageStore,
    QuotaLedger, RedisUsageStore, SessionStore, StreamRelay, SystemClock, UpstreamResponder,
    UsageStore,
};
use crate::utils::PasswordHashString;
use crate::{build_router, AppState};
use service_core::error::AppError;
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Collaborators that differ between production and tests.
pub struct Dependencies {
    pub store: Arc<dyn UsageStore>,
    pub responder: Option<Arc<dyn UpstreamResponder>>,
    pub clock: Arc<dyn Clock>,
}

impl Dependencies {
    /// Redis when configured, otherwise an in-process store.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self, AppError> {
        let store: Arc<dyn UsageStore> = match &config.redis {
            Some(redis) => {
                let store = RedisUsageStore::new(redis).await.map_err(|e| {
                    tracing::error!("Failed to connect to Redis: {}", e);
                    AppError::StorageError(anyhow::anyhow!(e))
                })?;
                Arc::new(store)
            }
            None => {
                tracing::warn!("REDIS_URL not set - usage counters are kept in memory");
                Arc::new(InMemoryUsageStore::new())
            }
        };

        let responder: Option<Arc<dyn UpstreamResponder>> = match &config.upstream {
            Some(upstream) => {
                let responder = HttpResponder::new(upstream.clone()).map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("Upstream client: {}", e))
                })?;
                tracing::info!(
                    url = %upstream.url,
                    model = %upstream.model,
                    "Initialized upstream responder"
                );
                Some(Arc::new(responder))
            }
            None => {
                tracing::warn!("UPSTREAM_URL not set - chat endpoints will be unavailable");
                None
            }
        };

        Ok(Self {
            store,
            responder,
            clock: Arc::new(SystemClock),
        })
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: GatewayConfig) -> Result<Self, AppError> {
        let deps = Dependencies::from_config(&config).await?;
        Self::build_with(config, deps).await
    }

    /// Build with explicit collaborators; binds `0.0.0.0:{port}` (0 picks a free port).
    pub async fn build_with(config: GatewayConfig, deps: Dependencies) -> Result<Self, AppError> {
        let credentials = CredentialManager::new(&config.auth);
        let quota = QuotaLedger::new(deps.store, deps.clock, config.quota.daily_limit);
        let sessions = Arc::new(SessionStore::new(config.session.max_stored_turns));
        let relay = StreamRelay::new(
            config.stream.heartbeat_interval(),
            config.stream.queue_capacity,
        );

        let gateway = GatewayService::new(
            credentials,
            quota,
            sessions,
            deps.responder,
            relay,
            GatewayPolicy::from_config(&config),
        );

        let state = AppState {
            password_hash: config
                .auth
                .password_hash
                .clone()
                .map(PasswordHashString::new),
            config: Arc::new(config),
            gateway: Arc::new(gateway),
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], state.config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            auth_required = state.config.auth.auth_required,
            quota_enforced = state.config.quota.enforced,
            daily_limit = state.config.quota.daily_limit,
            "Gateway service listening"
        );

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn gateway(&self) -> Arc<GatewayService> {
        self.state.gateway.clone()
    }

    /// Serve until `shutdown` resolves, then cancel and drain in-flight streams.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let gateway = self.state.gateway.clone();
        let ip_limiter = create_ip_rate_limiter(
            self.state.config.rate_limit.calls,
            self.state.config.rate_limit.window_seconds,
        );
        let router = build_router(self.state, ip_limiter);

        // Streams hold their connections open, so cancel them as soon as the signal fires.
        let stream_gateway = gateway.clone();
        let signal = async move {
            shutdown.await;
            stream_gateway.shutdown().await;
        };

        let result = axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        if let Err(e) = &result {
            tracing::error!("HTTP server error: {}", e);
        }

        gateway.shutdown().await;
        tracing::info!("Gateway service stopped");
        result
    }
}
