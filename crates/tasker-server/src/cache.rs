//! Result cache for terminal task records.
//!
//! [`ResultCache`] is the narrow interface the engine and workers depend on.
//! It never fails: any backend fault is logged and treated as a miss, since
//! the task store remains the source of truth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use tasker_core::{Task, TaskId};

use crate::metrics::Metrics;

const KEY_PREFIX: &str = "tasker:task:";

/// Cache backend errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Read a live entry.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write an entry that expires after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
}

/// In-process backend with lazy expiry.
pub struct MemoryCacheBackend {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    max_entries: usize,
}

impl MemoryCacheBackend {
    /// Create a backend holding at most `max_entries` entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it so the map does not grow with dead entries.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|(_, at)| *at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            entries.retain(|_, (_, at)| *at > now);
        }
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                entries.remove(&k);
            }
        }

        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }
}

/// Backend that stores nothing.
pub struct NoopCacheBackend;

#[async_trait]
impl CacheBackend for NoopCacheBackend {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Read-through/write-through cache of terminal task records.
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl ResultCache {
    /// Create a cache over `backend` with a fixed TTL.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            ttl,
            metrics,
        }
    }

    /// A cache that always misses.
    pub fn disabled(metrics: Arc<Metrics>) -> Self {
        Self::new(Arc::new(NoopCacheBackend), Duration::ZERO, metrics)
    }

    /// Time-to-live of cached records.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a terminal record. Faults and undecodable entries are misses.
    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        let key = cache_key(id);
        let cached = match self.backend.get(&key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(task_id = %id, error = %e, "Cache read failed, falling back to store");
                None
            }
        };

        let task = cached.and_then(|raw| match serde_json::from_str::<Task>(&raw) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Discarding undecodable cache entry");
                None
            }
        });

        match task {
            Some(task) => {
                debug!(task_id = %id, "Task cache hit");
                self.metrics.record_cache_hit();
                Some(task)
            }
            None => {
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    /// Store a terminal record. Non-terminal records are never cached.
    pub async fn put(&self, task: &Task) {
        if !task.is_terminal() {
            debug!(task_id = %task.id, status = %task.status, "Not caching non-terminal task");
            return;
        }
        if self.ttl.is_zero() {
            return;
        }

        let raw = match serde_json::to_string(task) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to encode task for cache");
                return;
            }
        };
        if let Err(e) = self.backend.set(&cache_key(&task.id), raw, self.ttl).await {
            warn!(task_id = %task.id, error = %e, "Cache write failed");
        }
    }
}

fn cache_key(id: &TaskId) -> String {
    format!("{KEY_PREFIX}{id}")
}
