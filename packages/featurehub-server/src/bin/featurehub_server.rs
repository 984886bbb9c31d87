//! FeatureHub server entry point.
//!
//! Wires the four components (router, metadata, migration, cleanup) onto
//! their own HTTP listeners in one process image, or brings up a single
//! component in isolation, per `--component`. All tunables are overridable
//! via CLI flags or `FEATUREHUB_*` environment variables (spec §6.4).

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::broadcast;
use tracing::info;

use featurehub_core::SystemClock;
use featurehub_server::backend::memory::MemoryBackend;
use featurehub_server::backend::resp::RespBackend;
use featurehub_server::backend::KvBackend;
use featurehub_server::bus::{EventBus, NullEventBus, PartitionedEventBus};
use featurehub_server::cleanup::{CleanupConfig, CleanupEngine};
use featurehub_server::http;
use featurehub_server::metadata::store::memory::InMemoryMetadataStore;
use featurehub_server::metadata::store::MetadataStore;
use featurehub_server::metadata::{MetadataCache, MetadataService};
use featurehub_server::migration::{MigrationConfig, MigrationEngine};
use featurehub_server::network::NetworkModule;
use featurehub_server::router::stats_queue::StatsQueue;
use featurehub_server::router::RouterService;
use featurehub_server::{BackendKind, FeatureHubConfig, ServiceContext, ServiceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Component {
    Router,
    Metadata,
    Migration,
    Cleanup,
    All,
}

/// Command-line/environment configuration. Every flag has a
/// `FEATUREHUB_<NAME>` environment equivalent via `clap`'s `env` feature.
#[derive(Debug, Parser)]
#[command(name = "featurehub-server", about = "FeatureHub tiered feature store")]
struct Args {
    /// Which component(s) to run in this process.
    #[arg(long, env = "FEATUREHUB_COMPONENT", value_enum, default_value = "all")]
    component: Component,

    /// Bind host shared by every component's listener.
    #[arg(long, env = "FEATUREHUB_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "FEATUREHUB_ROUTER_PORT", default_value_t = 8080)]
    router_port: u16,
    #[arg(long, env = "FEATUREHUB_METADATA_PORT", default_value_t = 8081)]
    metadata_port: u16,
    #[arg(long, env = "FEATUREHUB_MIGRATION_PORT", default_value_t = 8082)]
    migration_port: u16,
    #[arg(long, env = "FEATUREHUB_CLEANUP_PORT", default_value_t = 8083)]
    cleanup_port: u16,

    /// COLD backend: a `redb` file path (default) or a `host:port` RESP
    /// endpoint when `--cold-resp-address` is given instead.
    #[arg(long, env = "FEATUREHUB_COLD_REDB_PATH", default_value = "./featurehub-cold.redb")]
    cold_redb_path: String,
    #[arg(long, env = "FEATUREHUB_COLD_RESP_ADDRESS")]
    cold_resp_address: Option<String>,

    /// `PostgreSQL` connection string for the authoritative metadata store.
    /// Falls back to an in-process store (data lost on restart) if unset.
    #[arg(long, env = "FEATUREHUB_METADATA_DATABASE_URL")]
    metadata_database_url: Option<String>,

    /// Suppress all deletes in the migration and cleanup engines; report
    /// what would have happened instead (spec §4.3/§4.4 "Safety").
    #[arg(long, env = "FEATUREHUB_DRY_RUN", default_value_t = false)]
    dry_run: bool,

    #[arg(long, env = "FEATUREHUB_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn build_config(args: &Args) -> FeatureHubConfig {
    let mut config = FeatureHubConfig::default();
    config.ports.router = args.router_port;
    config.ports.metadata = args.metadata_port;
    config.ports.migration = args.migration_port;
    config.ports.cleanup = args.cleanup_port;
    config.network.host = args.host.clone();
    config.dry_run = args.dry_run;
    config.metadata_database_url = args.metadata_database_url.clone();
    config.cold_backend = match &args.cold_resp_address {
        Some(address) => BackendKind::Resp { address: address.clone() },
        None => BackendKind::Redb { path: args.cold_redb_path.clone() },
    };
    config
}

fn build_cold_backend(config: &FeatureHubConfig) -> anyhow::Result<Arc<dyn KvBackend>> {
    match &config.cold_backend {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        #[cfg(feature = "redb")]
        BackendKind::Redb { path } => {
            let backend = featurehub_server::backend::redb_backend::RedbBackend::open(path)
                .with_context(|| format!("failed to open redb COLD store at {path}"))?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "redb"))]
        BackendKind::Redb { .. } => {
            anyhow::bail!("redb COLD backend requested but feature \"redb\" is not enabled");
        }
        BackendKind::Resp { address } => {
            Ok(Arc::new(RespBackend::new(address.clone(), 16, config.backend_acquire_timeout)))
        }
    }
}

#[cfg(feature = "postgres")]
async fn build_metadata_store(config: &FeatureHubConfig) -> anyhow::Result<Arc<dyn MetadataStore>> {
    match &config.metadata_database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to metadata PostgreSQL database")?;
            Ok(Arc::new(featurehub_server::metadata::store::postgres::PgMetadataStore::new(pool)))
        }
        None => {
            info!("no FEATUREHUB_METADATA_DATABASE_URL set, using in-memory metadata store");
            Ok(Arc::new(InMemoryMetadataStore::new()))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_metadata_store(_config: &FeatureHubConfig) -> anyhow::Result<Arc<dyn MetadataStore>> {
    Ok(Arc::new(InMemoryMetadataStore::new()))
}

fn build_event_bus(config: &FeatureHubConfig) -> Arc<dyn EventBus> {
    if config.event_bus_partitions == 0 {
        return Arc::new(NullEventBus);
    }
    Arc::new(PartitionedEventBus::new(config.event_bus_partitions, |topic, partition_key, payload| {
        tracing::debug!(topic, partition_key, %payload, "event published");
    }))
}

/// Everything the router, migration engine and cleanup engine are built
/// from, shared across however many components this process runs.
struct Collaborators {
    hot: Arc<dyn KvBackend>,
    cold: Arc<dyn KvBackend>,
    metadata: Arc<MetadataService>,
    bus: Arc<dyn EventBus>,
}

async fn build_collaborators(config: &FeatureHubConfig) -> anyhow::Result<Collaborators> {
    let clock = Arc::new(SystemClock);
    let hot: Arc<dyn KvBackend> = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let cold = build_cold_backend(config)?;
    let store = build_metadata_store(config).await?;
    let cache = MetadataCache::new(config.metadata_cache_ttl, clock.clone());
    let metadata = Arc::new(MetadataService::new(store, cache, clock));
    let bus = build_event_bus(config);
    Ok(Collaborators { hot, cold, metadata, bus })
}

/// Builds one component's HTTP routes. Services with background sweep
/// loops (the router's stats queue aside, that's the migration and
/// cleanup engines) are registered with `registry` *before* their `Arc`
/// is pulled back out for the HTTP handlers, so the instance the registry
/// initializes/shuts down is the very same one the handlers call into.
fn build_routes(
    component: Component,
    config: &FeatureHubConfig,
    collab: &Collaborators,
    metrics: Option<PrometheusHandle>,
    registry: &ServiceRegistry,
) -> axum::Router {
    match component {
        Component::Router => {
            let stats_queue = StatsQueue::spawn(collab.metadata.clone(), config.stats_queue_capacity, config.stats_worker_count);
            registry.register(RouterService::new(
                collab.hot.clone(),
                collab.cold.clone(),
                collab.metadata.clone(),
                collab.bus.clone(),
                Arc::new(SystemClock),
                stats_queue,
                config.request_timeout_default,
            ));
            let router = registry.get::<RouterService>().expect("just registered");
            http::router::build_router(http::router::RouterState { router, metrics })
        }
        Component::Metadata => {
            http::metadata::build_router(http::metadata::MetadataState { metadata: collab.metadata.clone() })
        }
        Component::Migration => {
            registry.register(MigrationEngine::new(
                collab.hot.clone(),
                collab.cold.clone(),
                collab.metadata.clone(),
                collab.bus.clone(),
                Arc::new(SystemClock),
                MigrationConfig::from(config),
            ));
            let engine = registry.get::<MigrationEngine>().expect("just registered");
            http::migration::build_router(http::migration::MigrationState { engine })
        }
        Component::Cleanup => {
            registry.register(CleanupEngine::new(
                collab.hot.clone(),
                collab.cold.clone(),
                collab.metadata.clone(),
                collab.bus.clone(),
                Arc::new(SystemClock),
                CleanupConfig::from(config),
            ));
            let engine = registry.get::<CleanupEngine>().expect("just registered");
            http::cleanup::build_router(http::cleanup::CleanupState { engine })
        }
        Component::All => unreachable!("expanded to concrete components before build_routes is called"),
    }
}

/// Starts one component's HTTP listener, merges its routes with the
/// common health endpoints, and returns the task driving it to
/// completion. Shutdown is cooperative: every component subscribes to
/// the same broadcast and drains in parallel.
async fn spawn_component(
    name: &'static str,
    routes: axum::Router,
    network_config: featurehub_server::network::NetworkConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut module = NetworkModule::new(network_config);
    let port = module.start().await.with_context(|| format!("failed to bind {name} listener"))?;
    info!(component = name, port, "component listening");

    Ok(tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };
        if let Err(err) = module.serve(routes, shutdown).await {
            tracing::error!(component = name, %err, "component server exited with error");
        }
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = Arc::new(build_config(&args));
    info!(component = ?args.component, "FeatureHub server starting");

    let metrics_handle =
        PrometheusBuilder::new().install_recorder().context("failed to install Prometheus recorder")?;
    let collaborators = build_collaborators(&config).await?;
    let registry = ServiceRegistry::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = Vec::new();

    let components: Vec<Component> = match args.component {
        Component::All => vec![Component::Router, Component::Metadata, Component::Migration, Component::Cleanup],
        other => vec![other],
    };

    for component in components {
        let metrics = (component == Component::Router).then(|| metrics_handle.clone());
        let routes = build_routes(component, &config, &collaborators, metrics, &registry);
        let port = match component {
            Component::Router => config.ports.router,
            Component::Metadata => config.ports.metadata,
            Component::Migration => config.ports.migration,
            Component::Cleanup => config.ports.cleanup,
            Component::All => unreachable!("expanded above"),
        };
        let name: &'static str = match component {
            Component::Router => "router-http",
            Component::Metadata => "metadata-http",
            Component::Migration => "migration-http",
            Component::Cleanup => "cleanup-http",
            Component::All => unreachable!("expanded above"),
        };
        let network_config = config.network_config_for(port);
        tasks.push(spawn_component(name, routes, network_config, shutdown_tx.subscribe()).await?);
    }

    let ctx = ServiceContext { config: config.clone() };
    registry.init_all(&ctx).await?;

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    for task in tasks {
        let _ = task.await;
    }
    registry.shutdown_all(false).await?;

    info!("FeatureHub server stopped");
    Ok(())
}
