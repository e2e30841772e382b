//! Direct connection gate for privileged sessions.
//!
//! SYSDBA/SYSOPER logons cannot be pooled, so each one is a fresh physical
//! connection. The gate caps how many exist at once and queues the rest.
//!
//! ```text
//! acquire_direct(config)
//!   Queued ──(slot frees, FIFO)──→ Admitted ──→ Connecting(1..N) ──→ Succeeded
//!     │                                              │  └─ backoff n·unit, retry
//!     └─(wait budget spent)──→ Failed(queue timeout) └──→ Failed(exhausted)
//! ```
//!
//! Admission runs on a fair [`Semaphore`]: waiters are served in arrival
//! order, and a waiter whose wait budget runs out leaves the queue as its
//! acquire future is dropped. Dropping a [`GatePermit`] frees its slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{ConnectionConfig, GateSettings};
use crate::connection::Connection;
use crate::driver::{Driver, Session};
use crate::error::{DbError, DbResult};

/// Per-call overrides for the retry loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub max_retries: u32,
    pub attempt_timeout: Duration,
}

impl From<&GateSettings> for ConnectOptions {
    fn from(settings: &GateSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            attempt_timeout: settings.attempt_timeout,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateStats {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

/// One occupied direct-connection slot. Dropping it frees the slot.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GatePermit")
    }
}

/// Counts a caller as queued for as long as it is alive.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(queued: &'a AtomicUsize) -> Self {
        queued.fetch_add(1, Ordering::SeqCst);
        Self(queued)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded, FIFO-fair gate in front of direct (unpooled) connections.
pub struct DirectGate {
    slots: Arc<Semaphore>,
    queued: AtomicUsize,
    max_concurrent: usize,
    driver: Arc<dyn Driver>,
    settings: GateSettings,
}

impl DirectGate {
    pub fn new(settings: GateSettings, driver: Arc<dyn Driver>) -> Self {
        let max_concurrent = settings.max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            queued: AtomicUsize::new(0),
            max_concurrent,
            driver,
            settings,
        }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    /// Open a direct connection, waiting for a slot and retrying the connect.
    pub async fn acquire_direct(
        &self,
        config: &ConnectionConfig,
        options: ConnectOptions,
    ) -> DbResult<Connection> {
        let permit = self.admit().await?;
        // On error the permit drops here, freeing the slot.
        let session = self.connect_with_retry(config, options).await?;
        Ok(Connection::direct(session, permit))
    }

    async fn admit(&self) -> DbResult<GatePermit> {
        let slots = Arc::clone(&self.slots);
        match slots.clone().try_acquire_owned() {
            Ok(permit) => {
                tracing::debug!(active = self.active(), "direct connection admitted immediately");
                return Ok(GatePermit { _permit: permit });
            }
            Err(tokio::sync::TryAcquireError::Closed) => return Err(DbError::ShuttingDown),
            Err(tokio::sync::TryAcquireError::NoPermits) => {}
        }

        let waiting = Waiting::enter(&self.queued);
        tracing::debug!(
            queued = self.queued.load(Ordering::SeqCst),
            active = self.active(),
            "direct connection queued"
        );

        let waited = self.settings.queue_timeout;
        let admitted = tokio::time::timeout(waited, slots.acquire_owned()).await;
        drop(waiting);
        match admitted {
            Ok(Ok(permit)) => {
                tracing::debug!(active = self.active(), "admitted queued direct connection");
                Ok(GatePermit { _permit: permit })
            }
            Ok(Err(_)) => Err(DbError::ShuttingDown),
            Err(_) => {
                tracing::warn!(?waited, "direct connection queue wait expired");
                Err(DbError::DirectConnectQueueTimeout { waited })
            }
        }
    }

    fn active(&self) -> usize {
        self.max_concurrent.saturating_sub(self.slots.available_permits())
    }

    async fn connect_with_retry(
        &self,
        config: &ConnectionConfig,
        options: ConnectOptions,
    ) -> DbResult<Box<dyn Session>> {
        let attempts = options.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            tracing::debug!(
                host = %config.host,
                port = config.port,
                service = %config.service,
                privilege = %config.privilege,
                attempt,
                "direct connect attempt"
            );
            match tokio::time::timeout(options.attempt_timeout, self.driver.connect(config)).await {
                Ok(Ok(session)) => {
                    tracing::info!(host = %config.host, attempt, "direct connection established");
                    return Ok(session);
                }
                Ok(Err(e)) if !is_transient_connect_error(&e) => return Err(e),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("connect attempt timed out after {:?}", options.attempt_timeout)
                }
            }

            if attempt < attempts {
                let backoff = self.settings.retry_backoff * attempt;
                tracing::warn!(
                    host = %config.host,
                    attempt,
                    ?backoff,
                    error = %last_error,
                    "direct connect failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(DbError::DirectConnectExhausted {
            attempts,
            last_error,
        })
    }

    /// Reject new requests and fail everything still queued.
    pub fn close(&self) {
        self.slots.close();
        tracing::info!(
            dropped = self.queued.load(Ordering::SeqCst),
            active = self.active(),
            "direct gate closed"
        );
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            active: self.active(),
            queued: self.queued.load(Ordering::SeqCst),
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Credential and addressing failures will not fix themselves on retry.
fn is_transient_connect_error(err: &DbError) -> bool {
    !matches!(
        err,
        DbError::AuthenticationFailed(_)
            | DbError::ServiceNotFound(_)
            | DbError::InsufficientPrivilege(_)
    )
}

impl std::fmt::Debug for DirectGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectGate")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Privilege;
    use crate::testing::{Counters, Script, ScriptedDriver, target};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    fn gate(max_concurrent: usize, script: Script) -> (Arc<DirectGate>, ScriptedDriver) {
        let driver = ScriptedDriver::new(script);
        let settings = GateSettings {
            max_concurrent,
            ..GateSettings::default()
        };
        (Arc::new(DirectGate::new(settings, Arc::new(driver.clone()))), driver)
    }

    fn sys(id: &str) -> ConnectionConfig {
        target(id).with_privilege(Privilege::Sysdba)
    }

    /// Acquire a direct connection and hold it until signalled.
    fn hold(gate: &Arc<DirectGate>, id: &str) -> (oneshot::Sender<()>, JoinHandle<DbResult<()>>) {
        let (tx, rx) = oneshot::channel::<()>();
        let gate = Arc::clone(gate);
        let cfg = sys(id);
        let handle = tokio::spawn(async move {
            let conn = gate.acquire_direct(&cfg, ConnectOptions::from(gate.settings())).await?;
            let _ = rx.await;
            conn.release().await
        });
        (tx, handle)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn order(driver: &ScriptedDriver) -> Vec<String> {
        driver.connect_order.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn five_requests_against_ceiling_of_three() {
        let (gate, driver) = gate(3, Script::default());

        let mut holders = Vec::new();
        for i in 0..5 {
            holders.push(hold(&gate, &format!("r{i}")));
            settle().await;
        }

        assert_eq!(gate.stats(), GateStats { active: 3, queued: 2, max_concurrent: 3 });
        assert_eq!(order(&driver), ["r0", "r1", "r2"]);

        // Free r1: exactly one waiter (r3) is admitted.
        let (tx1, h1) = holders.remove(1);
        tx1.send(()).unwrap();
        h1.await.unwrap().unwrap();
        settle().await;
        assert_eq!(order(&driver), ["r0", "r1", "r2", "r3"]);
        assert_eq!(gate.stats().queued, 1);
        assert_eq!(gate.stats().active, 3);

        let (tx0, h0) = holders.remove(0);
        tx0.send(()).unwrap();
        h0.await.unwrap().unwrap();
        settle().await;
        assert_eq!(order(&driver), ["r0", "r1", "r2", "r3", "r4"]);
        assert_eq!(gate.stats().queued, 0);

        for (tx, h) in holders {
            tx.send(()).unwrap();
            h.await.unwrap().unwrap();
        }
        assert_eq!(gate.stats().active, 0);
        assert_eq!(Counters::get(&driver.counters.releases), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_times_out_and_is_removed_once() {
        let (gate, driver) = gate(1, Script::default());
        let (tx, holder) = hold(&gate, "holder");
        settle().await;

        let started = Instant::now();
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.acquire_direct(&sys("waiter"), ConnectOptions::from(gate.settings())).await
            })
        };
        settle().await;
        assert_eq!(gate.stats().queued, 1);

        match waiter.await.unwrap() {
            Err(DbError::DirectConnectQueueTimeout { waited }) => {
                assert_eq!(waited, Duration::from_secs(15));
            }
            other => panic!("expected queue timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(gate.stats().queued, 0);

        // Releasing the holder admits nobody: the expired waiter is gone.
        tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        settle().await;
        assert_eq!(Counters::get(&driver.counters.connects), 1);
        assert_eq!(gate.stats(), GateStats { active: 0, queued: 0, max_concurrent: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_with_linear_backoff() {
        let (gate, driver) = gate(3, Script::default());
        driver.script.connect_failures.store(2, Ordering::SeqCst);

        let started = Instant::now();
        let conn = gate
            .acquire_direct(&sys("a"), ConnectOptions::from(gate.settings()))
            .await
            .unwrap();
        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(Counters::get(&driver.counters.connects), 3);
        conn.release().await.unwrap();
        assert_eq!(gate.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_exhausted_frees_slot() {
        let (gate, driver) = gate(1, Script::default());
        driver.script.connect_failures.store(10, Ordering::SeqCst);

        let err = gate
            .acquire_direct(&sys("a"), ConnectOptions::from(gate.settings()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        match err {
            DbError::DirectConnectExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("ORA-12541"));
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
        assert_eq!(gate.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_admits_next_waiter() {
        let (gate, driver) = gate(1, Script {
            connect_delay: Duration::from_millis(10),
            ..Default::default()
        });
        driver.script.connect_failures.store(3, Ordering::SeqCst);

        let first = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.acquire_direct(&sys("first"), ConnectOptions::from(gate.settings())).await
            })
        };
        settle().await;
        let (tx, second) = hold(&gate, "second");
        settle().await;
        assert_eq!(gate.stats().queued, 1);

        assert!(first.await.unwrap().is_err());
        settle().await;
        settle().await;
        assert_eq!(gate.stats().active, 1);
        assert_eq!(order(&driver).last().map(String::as_str), Some("second"));

        tx.send(()).unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_not_retried() {
        let (gate, driver) = gate(3, Script::default());
        driver.script.connect_failures.store(5, Ordering::SeqCst);
        *driver.script.connect_error.lock().unwrap() =
            Some("ORA-01017: invalid username/password; logon denied".into());

        let err = gate
            .acquire_direct(&sys("a"), ConnectOptions::from(gate.settings()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::AuthenticationFailed(_)));
        assert_eq!(Counters::get(&driver.counters.connects), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_attempts_are_bounded() {
        let (gate, driver) = gate(1, Script {
            connect_delay: Duration::from_secs(60),
            ..Default::default()
        });
        let options = ConnectOptions {
            max_retries: 2,
            attempt_timeout: Duration::from_secs(5),
        };

        let started = Instant::now();
        let err = gate.acquire_direct(&sys("a"), options).await.unwrap_err();
        assert!(matches!(err, DbError::DirectConnectExhausted { attempts: 2, .. }));
        // Two 5s attempts plus one 1s backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(11));
        assert_eq!(Counters::get(&driver.counters.connects), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_does_not_leak_a_slot() {
        let (gate, _driver) = gate(1, Script::default());
        let (tx, holder) = hold(&gate, "holder");
        settle().await;

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.acquire_direct(&sys("w"), ConnectOptions::from(gate.settings())).await
            })
        };
        settle().await;
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(gate.stats().queued, 0);

        tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(gate.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_queued_and_new_requests() {
        let (gate, _driver) = gate(1, Script::default());
        let (tx, holder) = hold(&gate, "holder");
        settle().await;
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.acquire_direct(&sys("w"), ConnectOptions::from(gate.settings())).await
            })
        };
        settle().await;

        gate.close();
        assert_eq!(waiter.await.unwrap().unwrap_err(), DbError::ShuttingDown);
        assert_eq!(
            gate.acquire_direct(&sys("late"), ConnectOptions::from(gate.settings()))
                .await
                .unwrap_err(),
            DbError::ShuttingDown
        );

        tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(gate.stats().active, 0);
    }
}
