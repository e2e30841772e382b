//! Pooled connection manager for normal-privilege sessions.
//!
//! Pools are created lazily, one per [`PoolKey`]. Creation runs in a detached
//! task under a deadline; concurrent acquirers for the same key subscribe to
//! that single in-flight creation instead of racing to build duplicates.
//!
//! ```text
//! acquire(config)
//!   → slot Ready(pool)        → pool.get()
//!   → slot Creating(rx)       → await rx → pool.get() | error
//!   → no slot                 → insert Creating, spawn creation, await rx
//!        creation ok          → slot becomes Ready, all waiters proceed
//!        creation err/timeout → slot removed, all waiters get the error
//!
//! close(config)
//!   → slot Creating(rx)       → await rx, then close if Ready
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, watch};

use crate::config::{ConnectionConfig, PoolKey, PoolSettings};
use crate::connection::Connection;
use crate::driver::{Driver, DriverPool};
use crate::error::{DbError, DbResult};

type Creation = Option<DbResult<Arc<dyn DriverPool>>>;

enum PoolSlot {
    Ready(Arc<dyn DriverPool>),
    Creating(watch::Receiver<Creation>),
}

/// Snapshot of the pool map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolManagerStats {
    /// Pools that are up and serving connections.
    pub ready: usize,
    /// Pools whose creation is in flight.
    pub creating: usize,
    /// Creation attempts started since the manager was built.
    pub creation_attempts: u64,
}

/// Manages driver pools keyed by `(host, port, service, user, privilege)`.
pub struct ConnectionPoolManager {
    pools: Arc<Mutex<HashMap<PoolKey, PoolSlot>>>,
    driver: Arc<dyn Driver>,
    settings: PoolSettings,
    creation_attempts: Arc<AtomicU64>,
    /// When true, new `acquire()` calls are rejected.
    draining: AtomicBool,
}

impl ConnectionPoolManager {
    pub fn new(settings: PoolSettings, driver: Arc<dyn Driver>) -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            driver,
            settings,
            creation_attempts: Arc::new(AtomicU64::new(0)),
            draining: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// Borrow a pooled connection for `config`, creating its pool on first use.
    pub async fn acquire(&self, config: &ConnectionConfig) -> DbResult<Connection> {
        let key = config.pool_key();
        if config.privilege.is_privileged() {
            return Err(DbError::PrivilegedNotPoolable(key.to_string()));
        }
        if self.is_draining() {
            return Err(DbError::ShuttingDown);
        }

        let pool = self.pool_for(&key, config).await?;
        let session = pool.get().await?;
        tracing::debug!(pool_key = %key, "checked out pooled connection");
        Ok(Connection::pooled(session, key))
    }

    /// Return a pooled connection. Equivalent to `conn.release()`.
    pub async fn release(&self, conn: Connection) -> DbResult<()> {
        conn.release().await
    }

    async fn pool_for(&self, key: &PoolKey, config: &ConnectionConfig) -> DbResult<Arc<dyn DriverPool>> {
        let mut rx = {
            let mut pools = self.pools.lock().await;
            // Checked again under the lock so no slot appears after a drain.
            if self.is_draining() {
                return Err(DbError::ShuttingDown);
            }
            match pools.get(key) {
                Some(PoolSlot::Ready(pool)) => return Ok(Arc::clone(pool)),
                Some(PoolSlot::Creating(rx)) => {
                    tracing::debug!(pool_key = %key, "awaiting in-flight pool creation");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    pools.insert(key.clone(), PoolSlot::Creating(rx.clone()));
                    self.spawn_creation(key.clone(), config.clone(), tx, rx.clone());
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone(),
            Err(_) => None,
        };
        match outcome {
            Some(result) => result,
            None => {
                // Creator vanished without reporting; clear its marker so a
                // later call can retry.
                let mut pools = self.pools.lock().await;
                if matches!(pools.get(key), Some(PoolSlot::Creating(r)) if r.same_channel(&rx)) {
                    pools.remove(key);
                }
                Err(DbError::UnknownBackend(format!("pool creation for {key} was abandoned")))
            }
        }
    }

    fn spawn_creation(
        &self,
        key: PoolKey,
        config: ConnectionConfig,
        tx: watch::Sender<Creation>,
        own: watch::Receiver<Creation>,
    ) {
        let pools = Arc::clone(&self.pools);
        let driver = Arc::clone(&self.driver);
        let settings = self.settings.clone();
        let attempts = Arc::clone(&self.creation_attempts);

        tokio::spawn(async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                pool_key = %key,
                min = settings.min_size,
                max = settings.max_size,
                "creating connection pool"
            );

            let created = tokio::time::timeout(
                settings.create_timeout,
                driver.create_pool(&config, &settings),
            )
            .await;
            let mut outcome = match created {
                Ok(result) => result,
                Err(_) => Err(DbError::PoolCreationTimeout {
                    key: key.to_string(),
                    timeout: settings.create_timeout,
                }),
            };

            {
                let mut pools = pools.lock().await;
                let still_ours = matches!(
                    pools.get(&key),
                    Some(PoolSlot::Creating(r)) if r.same_channel(&own)
                );
                match &outcome {
                    Ok(pool) if still_ours => {
                        pools.insert(key.clone(), PoolSlot::Ready(Arc::clone(pool)));
                        tracing::info!(pool_key = %key, "connection pool ready");
                    }
                    Ok(pool) => {
                        // Closed while being created.
                        let pool = Arc::clone(pool);
                        let grace = settings.close_grace;
                        tokio::spawn(async move {
                            let _ = pool.close(grace).await;
                        });
                        outcome = Err(DbError::ShuttingDown);
                    }
                    Err(e) => {
                        if still_ours {
                            pools.remove(&key);
                        }
                        tracing::warn!(pool_key = %key, error = %e, "connection pool creation failed");
                    }
                }
            }

            let _ = tx.send(Some(outcome));
        });
    }

    /// Close and remove the pool for `config`. Returns whether one existed.
    ///
    /// A creation in flight is allowed to finish first; its marker stays in
    /// place meanwhile so no second creation starts for the key.
    pub async fn close(&self, config: &ConnectionConfig) -> DbResult<bool> {
        let key = config.pool_key();
        let pending = match self.pools.lock().await.get(&key) {
            Some(PoolSlot::Creating(rx)) => Some(rx.clone()),
            Some(PoolSlot::Ready(_)) => None,
            None => return Ok(false),
        };
        if let Some(mut rx) = pending {
            tracing::debug!(pool_key = %key, "waiting for in-flight pool creation before close");
            let _ = rx.wait_for(Option::is_some).await;
        }

        let pool = {
            let mut pools = self.pools.lock().await;
            match pools.get(&key) {
                Some(PoolSlot::Ready(pool)) => {
                    let pool = Arc::clone(pool);
                    pools.remove(&key);
                    pool
                }
                // Creation failed, or a newer creation owns the key.
                _ => return Ok(false),
            }
        };
        pool.close(self.settings.close_grace).await?;
        tracing::info!(pool_key = %key, "connection pool closed");
        Ok(true)
    }

    /// Stop accepting acquires and close every pool.
    ///
    /// Returns the number of pools that failed to close cleanly.
    pub async fn close_all(&self) -> usize {
        self.draining.store(true, Ordering::Relaxed);
        let slots: Vec<(PoolKey, PoolSlot)> = self.pools.lock().await.drain().collect();

        let mut failed = 0;
        for (key, slot) in slots {
            if let PoolSlot::Ready(pool) = slot {
                if let Err(e) = pool.close(self.settings.close_grace).await {
                    failed += 1;
                    tracing::warn!(pool_key = %key, error = %e, "failed to close connection pool");
                }
            }
        }
        tracing::info!(failed, "all connection pools closed");
        failed
    }

    pub async fn stats(&self) -> PoolManagerStats {
        let pools = self.pools.lock().await;
        let ready = pools
            .values()
            .filter(|s| matches!(s, PoolSlot::Ready(_)))
            .count();
        PoolManagerStats {
            ready,
            creating: pools.len() - ready,
            creation_attempts: self.creation_attempts.load(Ordering::SeqCst),
        }
    }

    pub async fn keys(&self) -> Vec<PoolKey> {
        self.pools.lock().await.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("settings", &self.settings)
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}
