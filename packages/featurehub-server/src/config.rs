//! Process-wide configuration (spec §6.4).
//!
//! A single [`FeatureHubConfig`] is loaded once in `main` and shared
//! (behind an `Arc`) with every component. Defaults match the values the
//! specification enumerates; everything is overridable via the `clap`
//! CLI/environment layer in `bin/featurehub_server.rs`.

use std::time::Duration;

use crate::network::NetworkConfig;

/// Per-component HTTP bind settings, keyed by the component's default port.
#[derive(Debug, Clone)]
pub struct ComponentPorts {
    pub router: u16,
    pub metadata: u16,
    pub migration: u16,
    pub cleanup: u16,
}

impl Default for ComponentPorts {
    fn default() -> Self {
        Self { router: 8080, metadata: 8081, migration: 8082, cleanup: 8083 }
    }
}

/// All tunables named in the specification's configuration section, plus
/// the connection strings needed to construct the backends and
/// authoritative store the spec treats as out-of-scope collaborators.
#[derive(Debug, Clone)]
pub struct FeatureHubConfig {
    pub ports: ComponentPorts,
    /// Template for per-component [`NetworkConfig`]s -- its `port` field is
    /// ignored; each component combines this with its own entry in `ports`
    /// via [`FeatureHubConfig::network_config_for`].
    pub network: NetworkConfig,

    // --- Migration candidate selection ---
    pub hot_to_cold_idle_ms: i64,
    pub cold_to_hot_access_threshold: i64,
    pub cold_to_hot_recent_ms: i64,
    /// Additive guard against selection churn (SPEC_FULL §9 open question 2):
    /// a key cannot be re-selected for HOT->COLD within this many ms of its
    /// last migration/update.
    pub min_stable_idle_ms: i64,

    // --- Migration/cleanup batching ---
    pub migration_batch_size: usize,
    pub batch_interval_ms: u64,
    pub max_migration_size: usize,
    pub max_recall_size: usize,
    pub hot_sweep_interval: Duration,
    pub cold_sweep_interval: Duration,

    pub cleanup_batch_size: usize,
    pub expired_retention_days: u32,
    pub orphan_cleanup_enabled: bool,
    pub expiry_sweep_interval: Duration,
    pub orphan_sweep_interval: Duration,

    // --- Metadata ---
    pub metadata_cache_ttl: Duration,
    pub max_batch_size: usize,
    pub max_key_length: usize,

    // --- Request handling ---
    pub request_timeout_default: Duration,
    pub backend_acquire_timeout: Duration,
    pub dry_run: bool,

    // --- Backend wiring (out of scope per spec.md §1/§6.2, wiring is not) ---
    pub hot_backend: BackendKind,
    pub cold_backend: BackendKind,
    pub metadata_database_url: Option<String>,
    pub stats_queue_capacity: usize,
    pub stats_worker_count: usize,
    pub event_bus_partitions: usize,
}

/// Which concrete [`crate::backend::KvBackend`] implementation to construct
/// for a tier.
#[derive(Debug, Clone)]
pub enum BackendKind {
    /// `DashMap`-backed, in-process. The only sensible choice for HOT.
    Memory,
    /// Local embedded disk store (via `redb`), for a self-contained COLD
    /// tier with no external dependency.
    Redb { path: String },
    /// A real Redis-protocol endpoint, `host:port`.
    Resp { address: String },
}

impl FeatureHubConfig {
    /// The [`NetworkConfig`] a single component should bind, combining the
    /// shared template with that component's configured port.
    #[must_use]
    pub fn network_config_for(&self, port: u16) -> NetworkConfig {
        NetworkConfig { port, ..self.network.clone() }
    }
}

impl Default for FeatureHubConfig {
    fn default() -> Self {
        Self {
            ports: ComponentPorts::default(),
            network: NetworkConfig::default(),

            hot_to_cold_idle_ms: 7 * 24 * 3600 * 1000,
            cold_to_hot_access_threshold: 10,
            cold_to_hot_recent_ms: 24 * 3600 * 1000,
            min_stable_idle_ms: 5 * 60 * 1000,

            migration_batch_size: 1_000,
            batch_interval_ms: 1_000,
            max_migration_size: 10_000,
            max_recall_size: 1_000,
            hot_sweep_interval: Duration::from_secs(5 * 60),
            cold_sweep_interval: Duration::from_secs(10 * 60),

            cleanup_batch_size: 1_000,
            expired_retention_days: 30,
            orphan_cleanup_enabled: true,
            expiry_sweep_interval: Duration::from_secs(24 * 3600),
            orphan_sweep_interval: Duration::from_secs(7 * 24 * 3600),

            metadata_cache_ttl: Duration::from_secs(30 * 60),
            max_batch_size: 1_000,
            max_key_length: 255,

            request_timeout_default: Duration::from_secs(5),
            backend_acquire_timeout: Duration::from_secs(3),
            dry_run: false,

            hot_backend: BackendKind::Memory,
            cold_backend: BackendKind::Redb { path: "./featurehub-cold.redb".to_string() },
            metadata_database_url: None,
            stats_queue_capacity: 10_000,
            stats_worker_count: 4,
            event_bus_partitions: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = FeatureHubConfig::default();
        assert_eq!(cfg.cold_to_hot_access_threshold, 10);
        assert_eq!(cfg.migration_batch_size, 1_000);
        assert_eq!(cfg.max_migration_size, 10_000);
        assert_eq!(cfg.metadata_cache_ttl, Duration::from_secs(1_800));
        assert_eq!(cfg.max_key_length, 255);
        assert!(!cfg.dry_run);
        assert!(cfg.orphan_cleanup_enabled);
    }

    #[test]
    fn default_ports_match_spec() {
        let ports = ComponentPorts::default();
        assert_eq!(ports.router, 8080);
        assert_eq!(ports.metadata, 8081);
        assert_eq!(ports.migration, 8082);
        assert_eq!(ports.cleanup, 8083);
    }
}
