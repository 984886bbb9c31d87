//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. This separation allows the caller to finish wiring
//! component-specific state (backends, metadata store, event bus) between
//! `start()` and `serve()`.
//!
//! Unlike a cluster node's network module, each FeatureHub component
//! (router, metadata, migration, cleanup) serves a plain request/response
//! HTTP API with no long-lived connections, so there is no connection
//! registry here to drain on shutdown -- draining means waiting for
//! in-flight requests, tracked by the [`ShutdownController`] alone.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{health_handler, liveness_handler, readiness_handler, AppState};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;

/// Manages a single component's HTTP server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- allocates the shutdown controller
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- merges the caller's routes with the common health
///    routes and begins accepting connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self { config, listener: None, shutdown: Arc::new(ShutdownController::new()) }
    }

    /// Returns a shared reference to the shutdown controller.
    ///
    /// The caller uses this to check health state, gate a background
    /// sweep loop on shutdown, or trigger shutdown itself.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    fn health_routes(&self) -> (Router, AppState) {
        let state = AppState {
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };
        let router = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .with_state(state.clone());
        (router, state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Merges `routes` with the common `/health` endpoints, applies the
    /// shared middleware stack, and serves until the shutdown future
    /// resolves.
    ///
    /// Consumes `self` because the listener is moved into the server.
    ///
    /// After the shutdown signal:
    /// 1. Health state transitions to Draining
    /// 2. Waits up to 30 seconds for in-flight requests to complete
    /// 3. Health state transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        routes: Router,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let (health_router, _state) = self.health_routes();
        let listener = self.listener.expect("start() must be called before serve()");
        let shutdown_ctrl = self.shutdown;

        let layers = build_http_layers(&self.config);
        let router = routes.merge(health_router).layer(layers);

        shutdown_ctrl.set_ready();

        info!("Serving HTTP connections");
        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        drain(shutdown_ctrl).await;
        Ok(())
    }
}

/// Transitions to Draining and waits for in-flight requests to finish.
async fn drain(shutdown_ctrl: Arc<ShutdownController>) {
    shutdown_ctrl.trigger_shutdown();

    let drained = shutdown_ctrl.wait_for_drain(Duration::from_secs(30)).await;
    if drained {
        info!("All in-flight requests drained successfully");
    } else {
        warn!("Drain timeout expired with in-flight requests remaining");
    }
}
