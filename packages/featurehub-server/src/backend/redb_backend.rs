//! `redb`-backed [`KvBackend`]: an embedded, disk-backed COLD tier for
//! deployments that don't want to stand up an external Redis-protocol
//! store. `redb` is synchronous, so every call is dispatched onto the
//! blocking pool via `tokio::task::spawn_blocking`, matching the general
//! "blocking engine behind an async trait" shape the teacher's storage
//! layer uses for its `StorageEngine` implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use featurehub_core::{Clock, FeatureError, SystemClock};
use redb::{Database, ReadableTable, TableDefinition};

use super::KvBackend;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("featurehub_cold");

/// Sentinel stored in the first 8 bytes of every value to mean "no TTL".
const NO_EXPIRY: i64 = -1;

fn encode(value: &[u8], expires_at_ms: Option<i64>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + value.len());
    buf.extend_from_slice(&expires_at_ms.unwrap_or(NO_EXPIRY).to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

fn decode(raw: &[u8]) -> (Option<i64>, Vec<u8>) {
    let mut head = [0u8; 8];
    head.copy_from_slice(&raw[..8]);
    let expires_at_ms = i64::from_le_bytes(head);
    let expiry = if expires_at_ms == NO_EXPIRY { None } else { Some(expires_at_ms) };
    (expiry, raw[8..].to_vec())
}

pub struct RedbBackend {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl RedbBackend {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let db = Database::create(path)?;
        {
            let txn = db.begin_write()?;
            txn.open_table(TABLE)?;
            txn.commit()?;
        }
        Ok(Self { db: Arc::new(db), clock: Arc::new(SystemClock) })
    }

    fn to_err(e: impl std::fmt::Display) -> FeatureError {
        FeatureError::backend_unavailable(e.to_string())
    }
}

#[async_trait]
impl KvBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FeatureError> {
        let db = self.db.clone();
        let key = key.to_string();
        let now = self.clock.now_ms();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(Self::to_err)?;
            let table = txn.open_table(TABLE).map_err(Self::to_err)?;
            match table.get(key.as_str()).map_err(Self::to_err)? {
                Some(raw) => {
                    let (expiry, value) = decode(raw.value());
                    if expiry.is_some_and(|exp| exp <= now) { Ok(None) } else { Ok(Some(value)) }
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| FeatureError::backend_unavailable(e.to_string()))?
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), FeatureError> {
        let db = self.db.clone();
        let key = key.to_string();
        let expires_at_ms = ttl_secs.map(|s| self.clock.now_ms() + s as i64 * 1000);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(Self::to_err)?;
            {
                let mut table = txn.open_table(TABLE).map_err(Self::to_err)?;
                table.insert(key.as_str(), encode(&value, expires_at_ms).as_slice()).map_err(Self::to_err)?;
            }
            txn.commit().map_err(Self::to_err)
        })
        .await
        .map_err(|e| FeatureError::backend_unavailable(e.to_string()))?
    }

    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, FeatureError> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    async fn del(&self, key: &str) -> Result<bool, FeatureError> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(Self::to_err)?;
            let existed = {
                let mut table = txn.open_table(TABLE).map_err(Self::to_err)?;
                table.remove(key.as_str()).map_err(Self::to_err)?.is_some()
            };
            txn.commit().map_err(Self::to_err)?;
            Ok(existed)
        })
        .await
        .map_err(|e| FeatureError::backend_unavailable(e.to_string()))?
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, FeatureError> {
        let mut count = 0;
        for key in keys {
            if self.del(key).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn exists(&self, key: &str) -> Result<bool, FeatureError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, FeatureError> {
        let db = self.db.clone();
        let key = key.to_string();
        let now = self.clock.now_ms();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(Self::to_err)?;
            let table = txn.open_table(TABLE).map_err(Self::to_err)?;
            match table.get(key.as_str()).map_err(Self::to_err)? {
                Some(raw) => {
                    let (expiry, _) = decode(raw.value());
                    Ok(expiry.map(|exp| (exp - now).max(0) / 1000))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| FeatureError::backend_unavailable(e.to_string()))?
    }

    async fn expire(&self, key: &str, secs: u64) -> Result<bool, FeatureError> {
        let existing = self.get(key).await?;
        match existing {
            Some(value) => {
                self.set(key, value, Some(secs)).await?;
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
        let db = self.db.clone();
        let prefix = prefix.to_string();
        let now = self.clock.now_ms();
        let matching: Vec<String> = tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(Self::to_err)?;
            let table = txn.open_table(TABLE).map_err(Self::to_err)?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(Self::to_err)? {
                let (k, v) = entry.map_err(Self::to_err)?;
                if !k.value().starts_with(prefix.as_str()) {
                    continue;
                }
                let (expiry, _) = decode(v.value());
                if expiry.is_some_and(|exp| exp <= now) {
                    continue;
                }
                keys.push(k.value().to_string());
            }
            Ok::<_, FeatureError>(keys)
        })
        .await
        .map_err(|e| FeatureError::backend_unavailable(e.to_string()))??;

        let offset = cursor as usize;
        let page: Vec<String> = matching.iter().skip(offset).take(count).cloned().collect();
        let next_offset = offset + page.len();
        let next_cursor = if next_offset >= matching.len() { 0 } else { next_offset as u64 };
        Ok((next_cursor, page))
    }
}
