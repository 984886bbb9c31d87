//! The physical-store capability trait (spec §6.2) and its implementations.
//!
//! HOT and COLD are both modeled behind one [`KvBackend`] trait and
//! selected by a [`featurehub_core::StorageTier`] tag rather than by a
//! subtype hierarchy (design note §9). The wire-level clients themselves
//! are thin collaborators, not part of the specified consistency model:
//! [`memory::MemoryBackend`] is the production HOT implementation,
//! [`resp::RespBackend`] talks to a real Redis-protocol COLD store, and
//! [`redb_backend::RedbBackend`] is a self-contained embedded-disk COLD
//! option for deployments without an external store.

pub mod memory;
#[cfg(feature = "redb")]
pub mod redb_backend;
pub mod resp;

use std::collections::HashMap;

use async_trait::async_trait;
use featurehub_core::FeatureError;

/// Capability set the router, migration engine and cleanup engine need
/// from a physical store (spec §6.2).
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FeatureError>;

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_secs: Option<u64>,
    ) -> Result<(), FeatureError>;

    /// Multi-get. Keys absent from the store are simply absent from the
    /// returned map, not an error.
    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, FeatureError>;

    async fn del(&self, key: &str) -> Result<bool, FeatureError>;

    async fn del_many(&self, keys: &[String]) -> Result<u64, FeatureError>;

    async fn exists(&self, key: &str) -> Result<bool, FeatureError>;

    /// Remaining TTL in seconds, `None` if the key has no TTL or is absent.
    async fn ttl(&self, key: &str) -> Result<Option<i64>, FeatureError>;

    async fn expire(&self, key: &str, secs: u64) -> Result<bool, FeatureError>;

    /// Cursor-based prefix scan, used only by the cleanup engine's orphan
    /// sweep. Returns the next cursor (0 means iteration is complete) and
    /// a page of matching keys.
    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), FeatureError>;
}
