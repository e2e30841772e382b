//! Target config resolution with a TTL cache.
//!
//! Durable target definitions live in a [`TargetStore`]; the
//! [`ConfigResolver`] reads the store once per cache miss and serves cached
//! configs for up to five minutes. Known mutation events (target edited or
//! deleted) must call [`ConfigResolver::invalidate`]; anything else is
//! tolerated as staleness up to the TTL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::{ConnectionConfig, OradashConfig};
use crate::error::{DbError, DbResult};

/// Default config cache TTL.
pub const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(300);

/// External store of target connection configs.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Load the config for `id`, or `None` if the target does not exist.
    async fn load(&self, id: &str) -> DbResult<Option<ConnectionConfig>>;
}

/// In-memory target store, for embedding callers and tests.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    targets: RwLock<HashMap<String, ConnectionConfig>>,
}

impl MemoryTargetStore {
    pub fn new(targets: impl IntoIterator<Item = ConnectionConfig>) -> Self {
        Self {
            targets: RwLock::new(targets.into_iter().map(|t| (t.id.clone(), t)).collect()),
        }
    }

    pub async fn upsert(&self, config: ConnectionConfig) {
        self.targets.write().await.insert(config.id.clone(), config);
    }

    pub async fn remove(&self, id: &str) -> Option<ConnectionConfig> {
        self.targets.write().await.remove(id)
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn load(&self, id: &str) -> DbResult<Option<ConnectionConfig>> {
        Ok(self.targets.read().await.get(id).cloned())
    }
}

/// Reads `[[targets]]` from an `oradash.toml` file on every load.
#[derive(Debug, Clone)]
pub struct FileTargetStore {
    path: PathBuf,
}

impl FileTargetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TargetStore for FileTargetStore {
    async fn load(&self, id: &str) -> DbResult<Option<ConnectionConfig>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| DbError::Store(format!("{}: {e}", self.path.display())))?;
        let config = OradashConfig::from_toml(&content)?;
        Ok(config.targets.into_iter().find(|t| t.id == id))
    }
}

struct CachedConfig {
    config: ConnectionConfig,
    inserted_at: Instant,
}

#[derive(Default)]
struct CacheStats {
    hits: u64,
    misses: u64,
}

/// Resolves target ids to connection configs through a TTL cache.
pub struct ConfigResolver {
    store: Arc<dyn TargetStore>,
    entries: Mutex<HashMap<String, CachedConfig>>,
    stats: Mutex<CacheStats>,
    ttl: Duration,
}

impl ConfigResolver {
    pub fn new(store: Arc<dyn TargetStore>) -> Self {
        Self::with_ttl(store, DEFAULT_CONFIG_TTL)
    }

    pub fn with_ttl(store: Arc<dyn TargetStore>, ttl: Duration) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            ttl,
        }
    }

    /// Resolve `id`, consulting the store only on a miss or expired entry.
    pub async fn resolve(&self, id: &str) -> DbResult<ConnectionConfig> {
        {
            let mut entries = self.entries.lock().await;
            match entries.get(id) {
                Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                    self.stats.lock().await.hits += 1;
                    tracing::debug!(target_id = %id, "config cache hit");
                    return Ok(entry.config.clone());
                }
                Some(_) => {
                    entries.remove(id);
                }
                None => {}
            }
        }

        self.stats.lock().await.misses += 1;
        tracing::debug!(target_id = %id, "config cache miss");

        let config = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| DbError::ConfigNotFound(id.to_string()))?;

        self.entries.lock().await.insert(
            id.to_string(),
            CachedConfig {
                config: config.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(config)
    }

    /// Drop the cached config for `id`. Returns whether an entry was present.
    pub async fn invalidate(&self, id: &str) -> bool {
        let removed = self.entries.lock().await.remove(id).is_some();
        if removed {
            tracing::debug!(target_id = %id, "config cache entry invalidated");
        }
        removed
    }

    pub async fn invalidate_all(&self) {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        tracing::info!(cleared = count, "config cache cleared");
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// `(hits, misses)` since creation.
    pub async fn stats(&self) -> (u64, u64) {
        let stats = self.stats.lock().await;
        (stats.hits, stats.misses)
    }
}

impl std::fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigResolver")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
