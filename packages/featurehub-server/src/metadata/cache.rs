//! Read-through TTL cache in front of the authoritative [`super::store::MetadataStore`]
//! (spec §4.2). Never authoritative: reads consult the cache first and
//! fall through to the store on miss; writes go to the store first, then
//! update or invalidate the cache entry. Cache write failures are
//! non-fatal and are only logged.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use featurehub_core::{Clock, FeatureMetadata};

struct CacheEntry {
    value: FeatureMetadata,
    inserted_at_ms: i64,
}

/// A `DashMap`-backed read-through cache keyed by feature key.
pub struct MetadataCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MetadataCache {
    #[must_use]
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { entries: DashMap::new(), ttl, clock }
    }

    fn is_fresh(&self, entry: &CacheEntry, now_ms: i64) -> bool {
        now_ms - entry.inserted_at_ms < self.ttl.as_millis() as i64
    }

    /// Returns the cached value if present and unexpired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<FeatureMetadata> {
        let now = self.clock.now_ms();
        match self.entries.get(key) {
            Some(entry) if self.is_fresh(&entry, now) => {
                metrics::counter!("featurehub_metadata_cache_hits_total").increment(1);
                Some(entry.value.clone())
            }
            Some(_) => {
                drop(self.entries.remove(key));
                metrics::counter!("featurehub_metadata_cache_misses_total").increment(1);
                None
            }
            None => {
                metrics::counter!("featurehub_metadata_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Multi-get. Keys not present (or expired) are simply absent from
    /// the returned map -- the caller fetches those from the
    /// authoritative store and calls [`Self::put_many`].
    #[must_use]
    pub fn get_many(&self, keys: &[String]) -> std::collections::HashMap<String, FeatureMetadata> {
        let now = self.clock.now_ms();
        let mut out = std::collections::HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.entries.get(key) {
                if self.is_fresh(&entry, now) {
                    out.insert(key.clone(), entry.value.clone());
                }
            }
        }
        metrics::counter!("featurehub_metadata_cache_hits_total").increment(out.len() as u64);
        metrics::counter!("featurehub_metadata_cache_misses_total").increment((keys.len() - out.len()) as u64);
        out
    }

    pub fn put(&self, value: FeatureMetadata) {
        let now = self.clock.now_ms();
        self.entries.insert(value.key_name.clone(), CacheEntry { value, inserted_at_ms: now });
    }

    pub fn put_many(&self, values: impl IntoIterator<Item = FeatureMetadata>) {
        for value in values {
            self.put(value);
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use featurehub_core::{StorageTier, TestClock};

    use super::*;

    fn sample(key: &str, now: i64) -> FeatureMetadata {
        FeatureMetadata::new_for_write(key, StorageTier::Hot, 1, now, None, None)
    }

    #[test]
    fn put_then_get_round_trips() {
        let clock = Arc::new(TestClock::new(0));
        let cache = MetadataCache::new(Duration::from_secs(60), clock);
        cache.put(sample("k", 0));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn entry_expires_after_ttl() {
        let clock = Arc::new(TestClock::new(0));
        let cache = MetadataCache::new(Duration::from_secs(60), clock.clone());
        cache.put(sample("k", 0));

        clock.advance(120_000);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let clock = Arc::new(TestClock::new(0));
        let cache = MetadataCache::new(Duration::from_secs(60), clock);
        cache.put(sample("k", 0));
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn get_many_skips_missing_and_expired() {
        let clock = Arc::new(TestClock::new(0));
        let cache = MetadataCache::new(Duration::from_secs(60), clock.clone());
        cache.put(sample("a", 0));
        cache.put(sample("b", 0));
        clock.advance(30_000);
        cache.put(sample("c", 30));
        clock.advance(40_000);

        let result = cache.get_many(&["a".into(), "b".into(), "c".into(), "missing".into()]);
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("c"));
    }
}
