//! Lifecycle registry shared by all four components.
//!
//! Each of the router, metadata, migration and cleanup components is a
//! [`ManagedService`], registered here so `bin/featurehub_server.rs` can
//! bring them up and tear them down uniformly, in `all`-in-one-process
//! mode as well as single-component mode.

use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::FeatureHubConfig;

/// Context handed to every service on `init`.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<FeatureHubConfig>,
}

/// Lifecycle-managed component. The router, metadata service, migration
/// engine and cleanup engine each implement this.
///
/// Services are registered with a [`ServiceRegistry`], initialized in
/// registration order, and shut down in reverse registration order.
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Unique name of this service (e.g. `"router"`, `"migration"`).
    fn name(&self) -> &'static str;

    /// Start background work (sweep loops, connection pools, HTTP listener).
    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Stop background work and release resources. `terminate` skips
    /// graceful draining when set (used on double-signal/forced shutdown).
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

/// Registry of lifecycle-managed components, looked up by name or by
/// concrete type.
pub struct ServiceRegistry {
    by_name: DashMap<&'static str, Arc<dyn ManagedService>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    init_order: RwLock<Vec<&'static str>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            init_order: RwLock::new(Vec::new()),
        }
    }

    pub fn register<T: ManagedService>(&self, service: T) {
        let name = service.name();
        let arc = Arc::new(service);
        self.by_name.insert(name, arc.clone());
        self.by_type.insert(TypeId::of::<T>(), arc);
        self.init_order.write().push(name);
    }

    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Initialize all registered services in registration order.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let order = self.init_order.read().clone();
        for name in &order {
            if let Some(service) = self.get_by_name(name) {
                service.init(ctx).await?;
            }
        }
        Ok(())
    }

    /// Shut down all registered services in reverse registration order.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let order = self.init_order.read().clone();
        for name in order.iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                service.shutdown(terminate).await?;
            }
        }
        Ok(())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
