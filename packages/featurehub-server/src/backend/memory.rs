//! `DashMap`-backed [`KvBackend`]: the production HOT implementation, and
//! a usable COLD stand-in for tests and local development.
//!
//! Grounded on the teacher's `HashMapStorage` (lock-free reads via
//! `DashMap`, cursor-based pagination with a little-endian offset cursor).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use featurehub_core::{Clock, FeatureError, SystemClock};

use super::KvBackend;

struct Entry {
    value: Vec<u8>,
    expires_at_ms: Option<i64>,
}

/// In-memory key-value store. Expiry is checked lazily on access rather
/// than by a background sweep, matching the teacher's "check on read"
/// posture for per-entry metadata.
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: DashMap::new(), clock: Arc::new(SystemClock) }
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: DashMap::new(), clock }
    }

    fn is_live(&self, entry: &Entry, now_ms: i64) -> bool {
        match entry.expires_at_ms {
            Some(exp) => exp > now_ms,
            None => true,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FeatureError> {
        let now = self.clock.now_ms();
        match self.entries.get(key) {
            Some(entry) if self.is_live(&entry, now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                drop(self.entries.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), FeatureError> {
        let expires_at_ms = ttl_secs.map(|secs| self.clock.now_ms() + secs as i64 * 1000);
        self.entries.insert(key.to_string(), Entry { value, expires_at_ms });
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, FeatureError> {
        let now = self.clock.now_ms();
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.entries.get(key) {
                if self.is_live(&entry, now) {
                    out.insert(key.clone(), entry.value.clone());
                }
            }
        }
        Ok(out)
    }

    async fn del(&self, key: &str) -> Result<bool, FeatureError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, FeatureError> {
        let mut count = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn exists(&self, key: &str) -> Result<bool, FeatureError> {
        let now = self.clock.now_ms();
        Ok(self.entries.get(key).is_some_and(|e| self.is_live(&e, now)))
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, FeatureError> {
        let now = self.clock.now_ms();
        Ok(self.entries.get(key).and_then(|e| e.expires_at_ms).map(|exp| (exp - now).max(0) / 1000))
    }

    async fn expire(&self, key: &str, secs: u64) -> Result<bool, FeatureError> {
        let now = self.clock.now_ms();
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at_ms = Some(now + secs as i64 * 1000);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), FeatureError> {
        let now = self.clock.now_ms();
        let mut matching: Vec<String> = self
            .entries
            .iter()
            .filter(|e| self.is_live(e.value(), now) && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        matching.sort();

        let offset = cursor as usize;
        let page: Vec<String> = matching.iter().skip(offset).take(count).cloned().collect();
        let next_offset = offset + page.len();
        let next_cursor = if next_offset >= matching.len() { 0 } else { next_offset as u64 };
        Ok((next_cursor, page))
    }
}
