//! `AppState` (the shared state carried through axum extractors) and the
//! health-check handlers common to every component's HTTP surface.

pub mod health;

pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};

/// Shared application state passed to the health handlers via `State`
/// extraction. Each component's own handlers carry additional state
/// (metadata store, backends, event bus) alongside this.
#[derive(Clone)]
pub struct AppState {
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration (bind address, CORS origins, timeouts).
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
