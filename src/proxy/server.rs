//! HTTP front-end built on Axum.
//!
//! Serves the dispatch surface (every path not claimed by the admin API
//! redirects through the dispatcher), the `/ipdadmin` management endpoints
//! and prometheus metrics. All shared state is immutable-after-load, so the
//! handlers share a plain `Arc<Dispatcher>`.

use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer, set_header::SetResponseHeaderLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    config::{self, Config},
    dispatch::Dispatcher,
    error::{Error, Result},
    proxy::handler,
    SERVER_TOKEN,
};

/// The dispatch server: configuration plus the loaded dispatch model.
pub struct DispatchServer {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl DispatchServer {
    /// Load the dispatch model from the configured directory and prepare
    /// the server. Configuration errors here are fatal to startup.
    pub fn new(config: Config) -> Result<Self> {
        info!("loading dispatch model from {}", config.config_dir.display());
        let dispatcher = config::load_dispatcher(&config.config_dir)?;
        Ok(Self::with_dispatcher(config, dispatcher))
    }

    /// Wrap an already built dispatcher (used by tests).
    pub fn with_dispatcher(config: Config, dispatcher: Dispatcher) -> Self {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            shutdown_tx,
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
        };

        let admin_routes = Router::new()
            .route("/set", post(handler::handle_admin_set))
            .route("/get", get(handler::handle_admin_get));

        Router::new()
            .nest("/ipdadmin", admin_routes)
            .route("/metrics", get(crate::metrics::prometheus_metrics))
            // Everything else is dispatch traffic; the path doubles as the
            // balancing key and the redirect suffix.
            .fallback(handler::handle_dispatch)
            .layer(
                ServiceBuilder::new()
                    .layer(SetResponseHeaderLayer::overriding(
                        header::SERVER,
                        HeaderValue::from_static(SERVER_TOKEN),
                    ))
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(Duration::from_secs(10)))
                    .layer(CorsLayer::permissive()),
            )
            .with_state(state)
    }

    /// Bind and serve until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("failed to bind {}: {}", addr, e)))?;

        info!("server listening on {}", addr);

        let router = self
            .build_router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("shutting down dispatch server gracefully...");
            })
            .await
            .map_err(|e| Error::Server(format!("server error: {}", e)))?;

        info!("dispatch server stopped");
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown_handle(&self) -> tokio::sync::broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
