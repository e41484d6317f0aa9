//! Key-value state shared across invocations.
//!
//! Nothing the resilience layer needs survives in process memory between
//! calls: rate-limit buckets, analytics and health history are all read,
//! modified and written back through a [`StateStore`]. Stores give no
//! transactional guarantee, so concurrent writers race on the same key and
//! the last write wins.

use crate::cache_validator::ValidatedStateEntry;
use crate::config::Config;
use crate::errors::ResilienceError;
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the bytes stored under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ResilienceError>;

    /// Stores `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ResilienceError>;

    /// Short backend name for diagnostics.
    fn backend(&self) -> &'static str;

    /// Approximate number of live entries, if the backend can tell cheaply.
    fn entry_count(&self) -> Option<u64> {
        None
    }
}

/// Loads and validates a JSON value.
///
/// Corrupted entries are logged and reported as absent.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, ResilienceError> {
    let Some(bytes) = store.get(key).await? else {
        return Ok(None);
    };

    let Some(data) = ValidatedStateEntry::from_bytes_validated(&bytes) else {
        tracing::warn!("Discarding corrupted state entry '{}'", key);
        return Ok(None);
    };

    match serde_json::from_str(&data) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!("Discarding undecodable state entry '{}': {}", key, e);
            Ok(None)
        }
    }
}

/// Serializes a value into a checksummed envelope and stores it.
pub async fn save_json<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), ResilienceError> {
    let data = serde_json::to_string(value)?;
    let bytes = ValidatedStateEntry::new(data).to_bytes()?;
    store.set(key, bytes, ttl).await
}

/// Picks the backend from configuration: Postgres when `STATE_STORE_URL` is set,
/// otherwise an in-process cache.
pub async fn from_config(config: &Config) -> anyhow::Result<Arc<dyn StateStore>> {
    match &config.state_store_url {
        Some(url) => {
            let db = crate::db::Database::new(url).await?;
            tracing::info!("Postgres state store connected");
            let store = crate::db_storage::PgStateStore::new(db.pool);
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!("Purged {} expired state rows", purged),
                Err(e) => tracing::warn!("Could not purge expired state rows: {}", e),
            }
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("Using in-process state store");
            Ok(Arc::new(MokaStateStore::new(DEFAULT_MEMORY_CAPACITY)))
        }
    }
}

const DEFAULT_MEMORY_CAPACITY: u64 = 10_000;

#[derive(Clone)]
struct StoredValue {
    bytes: Arc<[u8]>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with.
struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process store backed by a moka cache.
///
/// Only shared by invocations running in the same process; use the
/// Postgres store when several processes serve requests.
#[derive(Clone)]
pub struct MokaStateStore {
    cache: Cache<String, StoredValue>,
}

impl MokaStateStore {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

impl Default for MokaStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

#[async_trait]
impl StateStore for MokaStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ResilienceError> {
        Ok(self.cache.get(key).await.map(|value| value.bytes.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ResilienceError> {
        self.cache
            .insert(
                key.to_string(),
                StoredValue {
                    bytes: Arc::from(value),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn entry_count(&self) -> Option<u64> {
        Some(self.cache.entry_count())
    }
}
