//! Key-value store with per-key expiry
//!
//! Backs every piece of short-lived working state: rate-limit windows, the
//! compensation cache and workflow state. Nothing stored here is a source of
//! truth; losing an entry costs observability, never correctness.
//!
//! Two backends share the same semantics:
//!
//! - [`RedisStore`] for deployments (shared across api and worker processes)
//! - [`InMemoryStore`] for tests and single-process development

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Errors raised by a key-value backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Stored value is not valid: {0}")]
    InvalidValue(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Minimal get/set/increment/expire interface over a TTL store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store `value`, replacing any previous value and expiry.
    /// `None` means the key never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Increment an integer counter, creating it at 1 without expiry when absent.
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Remaining time to live, `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Connect to Redis when a URL is configured, otherwise fall back to memory.
pub async fn connect_store(redis_url: Option<&str>) -> StoreResult<Arc<dyn KeyValueStore>> {
    match redis_url {
        Some(url) if !url.is_empty() => {
            let store = RedisStore::connect(url).await?;
            tracing::info!("Key-value store connected to Redis");
            Ok(Arc::new(store))
        }
        _ => {
            tracing::warn!(
                "REDIS_URL not set - using in-memory key-value store (state is per-process)"
            );
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

// =============================================================================
// Redis backend
// =============================================================================

/// Redis-backed store. Cloning shares the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: bool = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        // -2: missing, -1: no expiry
        let seconds: i64 = conn.ttl(key).await?;
        Ok((seconds >= 0).then(|| Duration::from_secs(seconds as u64)))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Writes between sweeps of expired entries.
const SWEEP_EVERY: u64 = 256;

/// Process-local store. Expired entries are invisible to reads and are
/// swept every [`SWEEP_EVERY`] writes or by [`InMemoryStore::cleanup`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    writes: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.is_live(now));
    }

    fn sweep_if_due(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            entries.retain(|_, entry| entry.is_live(now));
        }
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut entries = self.entries.write().await;
        self.sweep_if_due(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        self.sweep_if_due(&mut entries, now);

        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                let current: i64 = entry.value.parse().map_err(|_| {
                    StoreError::InvalidValue(format!("{key} does not hold an integer"))
                })?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key).filter(|e| e.is_live(now)) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}
