//! Query executor: statements under a hard deadline.
//!
//! ```text
//! execute(config, sql, binds, options)
//!   → acquire: pool (normal) | direct gate (SYSDBA/SYSOPER)
//!   → race statement vs deadline
//!       finished first → release (pool reuse / free gate slot)
//!       deadline first → cancel token → driver interrupt → close, QueryTimeout
//!       interrupt unacknowledged after grace → close deferred until the
//!                                              driver call returns
//! ```
//!
//! Every acquired connection is released or closed exactly once, whatever
//! the outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionConfig, ExecutorSettings};
use crate::connection::Connection;
use crate::driver::{Binds, QueryOutput, StatementOptions};
use crate::error::{DbError, DbResult};
use crate::gate::{ConnectOptions, DirectGate};
use crate::pool::ConnectionPoolManager;

/// How a statement ended relative to its deadline.
enum Deadline {
    Met(DbResult<QueryOutput>),
    /// Interrupted. `settled` is false when the driver call had not
    /// returned by the end of the cancel grace.
    Missed { settled: bool },
}

/// Per-call execution options. Unset fields fall back to [`ExecutorSettings`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub max_rows: Option<usize>,
    pub auto_commit: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_rows: None,
            auto_commit: true,
        }
    }
}

impl ExecuteOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

pub struct QueryExecutor {
    pools: Arc<ConnectionPoolManager>,
    gate: Arc<DirectGate>,
    settings: ExecutorSettings,
}

impl QueryExecutor {
    pub fn new(
        pools: Arc<ConnectionPoolManager>,
        gate: Arc<DirectGate>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            pools,
            gate,
            settings,
        }
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn gate(&self) -> &Arc<DirectGate> {
        &self.gate
    }

    /// Acquire a connection by privilege: pooled for normal sessions,
    /// through the direct gate for privileged ones.
    pub async fn acquire(&self, config: &ConnectionConfig) -> DbResult<Connection> {
        if config.privilege.is_privileged() {
            let options = ConnectOptions::from(self.gate.settings());
            self.gate.acquire_direct(config, options).await
        } else {
            self.pools.acquire(config).await
        }
    }

    pub async fn execute(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        binds: &Binds,
        options: &ExecuteOptions,
    ) -> DbResult<QueryOutput> {
        let started = Instant::now();
        let conn = self.acquire(config).await?;

        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        let statement = StatementOptions {
            max_rows: options.max_rows.unwrap_or(self.settings.max_rows),
            auto_commit: options.auto_commit,
        };

        let result = match self.run_with_deadline(&conn, sql, binds, &statement, timeout).await {
            Deadline::Met(result) => result,
            Deadline::Missed { settled: true } => Err(DbError::QueryTimeout { timeout }),
            Deadline::Missed { settled: false } => {
                // The session and its gate slot stay in use until the
                // blocked call returns.
                conn.close_in_background();
                tracing::debug!(host = %config.host, ?timeout, "statement timed out, close deferred");
                return Err(DbError::QueryTimeout { timeout });
            }
        };

        match result {
            Ok(mut output) => {
                if let Err(e) = conn.release().await {
                    tracing::warn!(error = %e, "failed to release connection after query");
                }
                output.elapsed = started.elapsed();
                tracing::debug!(
                    host = %config.host,
                    rows = output.rows.len(),
                    elapsed_ms = output.elapsed.as_millis() as u64,
                    "statement completed"
                );
                Ok(output)
            }
            Err(e) => {
                // After an interrupt or a lost link the session state is not
                // trusted, so it is closed instead of reused.
                let discard = matches!(e, DbError::QueryTimeout { .. } | DbError::ServerUnreachable(_));
                let finished = if discard { conn.close().await } else { conn.release().await };
                if let Err(close_err) = finished {
                    tracing::warn!(error = %close_err, "failed to dispose connection after error");
                }
                tracing::debug!(host = %config.host, error = %e, discarded = discard, "statement failed");
                Err(e)
            }
        }
    }

    async fn run_with_deadline(
        &self,
        conn: &Connection,
        sql: &str,
        binds: &Binds,
        options: &StatementOptions,
        timeout: Duration,
    ) -> Deadline {
        let cancel = CancellationToken::new();
        let exec = conn.execute(sql, binds, options, cancel.clone());
        tokio::pin!(exec);

        match tokio::time::timeout(timeout, &mut exec).await {
            Ok(result) => Deadline::Met(result),
            Err(_) => {
                tracing::warn!(?timeout, "statement deadline reached, interrupting");
                cancel.cancel();
                // Give the session a bounded window to deliver the interrupt.
                let settled = tokio::time::timeout(self.settings.cancel_grace, &mut exec)
                    .await
                    .is_ok();
                if !settled {
                    tracing::warn!(grace = ?self.settings.cancel_grace, "driver did not acknowledge interrupt");
                }
                Deadline::Missed { settled }
            }
        }
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GateSettings, PoolSettings, Privilege};
    use crate::driver::Value;
    use crate::testing::{Counters, Script, ScriptedDriver, single_row, target};

    fn executor(script: Script) -> (Arc<QueryExecutor>, ScriptedDriver) {
        let driver = ScriptedDriver::new(script);
        let shared: Arc<dyn crate::driver::Driver> = Arc::new(driver.clone());
        let pools = Arc::new(ConnectionPoolManager::new(PoolSettings::default(), shared.clone()));
        let gate = Arc::new(DirectGate::new(GateSettings::default(), shared));
        let exec = QueryExecutor::new(pools, gate, ExecutorSettings::default());
        (Arc::new(exec), driver)
    }

    #[tokio::test]
    async fn successful_query_is_released_to_pool() {
        let (exec, driver) = executor(Script::default());
        driver.respond("FROM dual", Ok(single_row(&[("X", Value::from("1"))])));

        let out = exec
            .execute(&target("prod"), "SELECT 1 x FROM dual", &Binds::None, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(out.cell(0, "x"), Some(&Value::from("1")));
        assert_eq!(Counters::get(&driver.counters.releases), 1);
        assert_eq!(Counters::get(&driver.counters.closes), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_interrupts_and_closes_connection() {
        let (exec, driver) = executor(Script {
            exec_delay: Duration::from_secs(60),
            ..Default::default()
        });

        let started = Instant::now();
        let err = exec
            .execute(&target("prod"), "SELECT * FROM big", &Binds::None, &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, DbError::QueryTimeout { timeout: Duration::from_secs(10) });
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(Counters::get(&driver.counters.interrupts), 1);
        assert_eq!(Counters::get(&driver.counters.closes), 1);
        assert_eq!(Counters::get(&driver.counters.releases), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_overrides_default() {
        let (exec, driver) = executor(Script {
            exec_delay: Duration::from_secs(3),
            ..Default::default()
        });
        let options = ExecuteOptions::default().with_timeout(Duration::from_secs(1));
        let err = exec
            .execute(&target("prod"), "SELECT 1 FROM dual", &Binds::None, &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::QueryTimeout);
        assert_eq!(Counters::get(&driver.counters.closes), 1);

        let options = ExecuteOptions::default().with_timeout(Duration::from_secs(5));
        exec.execute(&target("prod"), "SELECT 1 FROM dual", &Binds::None, &options)
            .await
            .unwrap();
        assert_eq!(Counters::get(&driver.counters.releases), 1);
    }

    #[tokio::test]
    async fn privileged_execution_uses_direct_gate() {
        let (exec, driver) = executor(Script::default());
        let cfg = target("sys").with_privilege(Privilege::Sysdba);

        exec.execute(&cfg, "SELECT 1 FROM dual", &Binds::None, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(Counters::get(&driver.counters.pool_creates), 0);
        assert_eq!(Counters::get(&driver.counters.connects), 1);
        assert_eq!(Counters::get(&driver.counters.releases), 1);
        assert_eq!(exec.gate().stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn privileged_timeout_frees_gate_slot() {
        let (exec, driver) = executor(Script {
            exec_delay: Duration::from_secs(30),
            ..Default::default()
        });
        let cfg = target("sys").with_privilege(Privilege::Sysoper);

        let err = exec
            .execute(&cfg, "SELECT 1 FROM dual", &Binds::None, &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::QueryTimeout { .. }));
        assert_eq!(Counters::get(&driver.counters.closes), 1);
        assert_eq!(exec.gate().stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_interrupt_keeps_gate_slot_until_call_returns() {
        let (exec, driver) = executor(Script {
            exec_delay: Duration::from_secs(30),
            ignores_cancel: true.into(),
            ..Default::default()
        });
        let cfg = target("sys").with_privilege(Privilege::Sysdba);

        let started = Instant::now();
        let err = exec
            .execute(&cfg, "SELECT 1 FROM dual", &Binds::None, &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, DbError::QueryTimeout { timeout: Duration::from_secs(10) });
        // Deadline plus the cancel grace.
        assert_eq!(started.elapsed(), Duration::from_secs(12));
        assert_eq!(exec.gate().stats().active, 1);
        assert_eq!(Counters::get(&driver.counters.closes), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(Counters::get(&driver.counters.closes), 1);
        assert_eq!(Counters::get(&driver.counters.releases), 0);
        assert_eq!(exec.gate().stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_interrupt_never_returns_session_to_pool() {
        let (exec, driver) = executor(Script {
            exec_delay: Duration::from_secs(30),
            ignores_cancel: true.into(),
            ..Default::default()
        });

        let err = exec
            .execute(&target("prod"), "SELECT 1 FROM dual", &Binds::None, &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::QueryTimeout { .. }));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(Counters::get(&driver.counters.closes), 1);
        assert_eq!(Counters::get(&driver.counters.releases), 0);
    }

    #[tokio::test]
    async fn driver_error_releases_connection() {
        let (exec, driver) = executor(Script::default());
        driver.respond(
            "v$session",
            Err(crate::error::classify("ORA-00942: table or view does not exist")),
        );

        let err = exec
            .execute(&target("prod"), "SELECT * FROM v$session", &Binds::None, &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InsufficientPrivilege(_)));
        assert_eq!(Counters::get(&driver.counters.releases), 1);
        assert_eq!(Counters::get(&driver.counters.closes), 0);
    }

    #[tokio::test]
    async fn lost_link_closes_connection() {
        let (exec, driver) = executor(Script::default());
        driver.respond(
            "FROM dual",
            Err(crate::error::classify("ORA-03113: end-of-file on communication channel")),
        );

        let err = exec
            .execute(&target("prod"), "SELECT 1 FROM dual", &Binds::None, &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ServerUnreachable(_)));
        assert_eq!(Counters::get(&driver.counters.closes), 1);
        assert_eq!(Counters::get(&driver.counters.releases), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_execution_disposes_exactly_one_connection() {
        let (exec, driver) = executor(Script {
            exec_delay: Duration::from_millis(700),
            ..Default::default()
        });

        let mut handles = Vec::new();
        for i in 0..12u64 {
            let exec = Arc::clone(&exec);
            handles.push(tokio::spawn(async move {
                let mut cfg = target("prod");
                if i % 3 == 0 {
                    cfg = cfg.with_privilege(Privilege::Sysdba);
                }
                // Every fourth call gets a deadline shorter than the latency.
                let timeout = if i % 4 == 0 { Duration::from_millis(200) } else { Duration::from_secs(5) };
                let options = ExecuteOptions::default().with_timeout(timeout);
                exec.execute(&cfg, "SELECT 1 FROM dual", &Binds::None, &options).await
            }));
        }
        let mut timeouts = 0;
        for h in handles {
            if h.await.unwrap().is_err() {
                timeouts += 1;
            }
        }

        let acquired = Counters::get(&driver.counters.gets) + Counters::get(&driver.counters.connects);
        let disposed = Counters::get(&driver.counters.releases) + Counters::get(&driver.counters.closes);
        assert_eq!(acquired, 12);
        assert_eq!(disposed, 12);
        assert_eq!(timeouts, 3);
        assert_eq!(Counters::get(&driver.counters.closes), 3);
        assert_eq!(exec.gate().stats().active, 0);
    }
}
