//! HTTP server assembly for prism

mod cors;
mod health;
mod request_context;

use std::net::SocketAddr;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use prism_config::Config;
use prism_llm::LlmState;
use tower_http::trace::TraceLayer;

const DEFAULT_LISTEN_ADDRESS: ([u8; 4], u16) = ([0, 0, 0, 0], 3000);

/// Assembled server with all routes and middleware
pub struct Server {
    router: Router,
    listen_address: SocketAddr,
}

impl Server {
    /// Build the server from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a provider fails to initialize
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let state = LlmState::from_config(&config.llm).await?;
        Ok(Self::with_state(&config, state))
    }

    /// Build the server around an already constructed [`LlmState`]
    pub fn with_state(config: &Config, state: LlmState) -> Self {
        let listen_address = config
            .server
            .listen_address
            .unwrap_or_else(|| SocketAddr::from(DEFAULT_LISTEN_ADDRESS));

        tracing::info!(
            providers = state.registry().providers().count(),
            default_provider = config.llm.default_provider.as_deref().unwrap_or("none"),
            "gateway state ready"
        );

        let mut app = prism_llm::llm_router(state);

        if config.server.health.enabled {
            app = app.route(&config.server.health.path, axum::routing::get(health::health_handler));
        }

        // Innermost first: the context is built just before handlers run
        app = app
            .layer(axum::middleware::from_fn(request_context::request_context_middleware))
            .layer(DefaultBodyLimit::max(config.server.body_limit_mb.saturating_mul(1024 * 1024)))
            .layer(TraceLayer::new_for_http());

        if let Some(ref cors_config) = config.server.cors {
            app = app.layer(cors::cors_layer(cors_config));
        }

        Self {
            router: app,
            listen_address,
        }
    }

    /// Override the configured listen address
    #[must_use]
    pub const fn with_listen_address(mut self, listen_address: SocketAddr) -> Self {
        self.listen_address = listen_address;
        self
    }

    #[must_use]
    pub const fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Consume the server and return the inner router
    ///
    /// Useful for testing when the caller manages the listener
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve until the cancellation token fires
    ///
    /// # Errors
    ///
    /// Returns an error if binding the TCP listener or serving fails
    pub async fn serve(self, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("graceful shutdown initiated");
            })
            .await?;

        Ok(())
    }
}
