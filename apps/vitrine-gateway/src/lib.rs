pub mod auth;
pub mod cli;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod telemetry;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    auth::{AuthClient, IngestVerifier, TokenValidator},
    config::GatewayConfig,
    connection::{ConnectionRegistry, ConnectionSettings},
    media::{HttpMediaEngine, InMemoryMediaEngine, MediaEngine},
    registry::TenantRegistry,
    relay::AgentRelay,
    session::SignalingContext,
};

#[derive(Clone)]
pub struct AppState {
    pub signaling: SignalingContext,
    pub connections: ConnectionRegistry,
    pub settings: Arc<ConnectionSettings>,
    /// When set, ingest endpoints require a verified bearer key.
    pub ingest_guard: Option<Arc<dyn IngestVerifier>>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(signaling: SignalingContext, settings: ConnectionSettings) -> Self {
        Self {
            signaling,
            connections: ConnectionRegistry::new(),
            settings: Arc::new(settings),
            ingest_guard: None,
            metrics: None,
        }
    }

    pub fn with_ingest_guard(mut self, guard: Arc<dyn IngestVerifier>) -> Self {
        self.ingest_guard = Some(guard);
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.signaling.registry
    }

    /// Wires the production collaborators described by `config`.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let engine: Arc<dyn MediaEngine> = match &config.media_url {
            Some(url) => {
                info!(media_url = %url, "using HTTP media engine");
                Arc::new(
                    HttpMediaEngine::new(url.clone(), config.call_timeout)
                        .context("failed to build media engine client")?,
                )
            }
            None => {
                warn!("no media worker configured; using in-memory loopback engine");
                Arc::new(InMemoryMediaEngine::new())
            }
        };

        let auth = Arc::new(
            AuthClient::new(config.auth_base.clone(), config.call_timeout)
                .context("failed to build auth client")?,
        );
        let registry = TenantRegistry::new(engine, config.announced_ip.clone());
        let relay = AgentRelay::new(
            registry.clone(),
            config.agents.clone(),
            config.agent_connect_timeout,
        );
        let validator: Arc<dyn TokenValidator> = auth.clone();
        let signaling = SignalingContext {
            registry,
            validator,
            relay,
            call_timeout: config.call_timeout,
        };

        let state = AppState::new(signaling, config.connection_settings());
        Ok(if config.require_ingest_auth {
            state.with_ingest_guard(auth)
        } else {
            state
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/rtp-capabilities", get(handlers::rtp_capabilities))
        .route("/rtp-endpoint/:code", post(handlers::rtp_endpoint))
        .route("/rtp-producers/:code", post(handlers::rtp_producers))
        .route("/tenants/:code", delete(handlers::delete_tenant))
        .route("/debug/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(connection::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the gateway until `shutdown` resolves, then releases every
/// tenant's media resources, waiting at most `grace` for the engine.
pub async fn serve<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
    grace: Duration,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry().clone();
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")?;

    match tokio::time::timeout(grace, registry.teardown_all()).await {
        Ok(released) => info!(tenants = released, "tenant resources released"),
        Err(_) => warn!(
            grace_seconds = grace.as_secs(),
            "tenant teardown did not finish within the grace period"
        ),
    }
    Ok(())
}
