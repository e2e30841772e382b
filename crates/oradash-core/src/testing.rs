//! Scripted driver shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionConfig, PoolSettings};
use crate::driver::{Binds, ColumnMeta, Driver, DriverPool, QueryOutput, Session, StatementOptions, Value};
use crate::error::{DbError, DbResult};

/// Counters shared by every pool and session a [`ScriptedDriver`] hands out.
#[derive(Debug, Default)]
pub struct Counters {
    pub pool_creates: AtomicU64,
    pub connects: AtomicU64,
    pub gets: AtomicU64,
    pub releases: AtomicU64,
    pub closes: AtomicU64,
    pub interrupts: AtomicU64,
    pub pool_closes: AtomicU64,
}

impl Counters {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct Script {
    /// Delay before a pool comes up.
    pub pool_delay: Duration,
    /// Pool creation never completes.
    pub pool_hangs: AtomicBool,
    /// Pool creation fails with this message.
    pub pool_error: Mutex<Option<String>>,
    /// Delay before a direct connect completes.
    pub connect_delay: Duration,
    /// Number of upcoming direct connects that fail.
    pub connect_failures: AtomicU32,
    pub connect_error: Mutex<Option<String>>,
    /// Statement latency.
    pub exec_delay: Duration,
    /// Statements keep running after cancel, like a driver that never
    /// acknowledges the interrupt.
    pub ignores_cancel: AtomicBool,
    /// `(sql fragment, response)` pairs; first match wins.
    pub responses: Mutex<Vec<(String, DbResult<QueryOutput>)>>,
}

/// Driver whose behaviour is set up by each test.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    pub counters: Arc<Counters>,
    pub script: Arc<Script>,
    /// Target ids in the order their direct connects started.
    pub connect_order: Arc<Mutex<Vec<String>>>,
    /// Options of every statement executed, in order.
    pub statements: Arc<Mutex<Vec<StatementOptions>>>,
}

impl ScriptedDriver {
    pub fn new(script: Script) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            script: Arc::new(script),
            connect_order: Arc::new(Mutex::new(Vec::new())),
            statements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn respond(&self, fragment: &str, response: DbResult<QueryOutput>) {
        self.script
            .responses
            .lock()
            .unwrap()
            .push((fragment.to_string(), response));
    }

    fn session(&self) -> Box<dyn Session> {
        Box::new(ScriptedSession {
            counters: self.counters.clone(),
            script: self.script.clone(),
            statements: self.statements.clone(),
            busy: Arc::new(tokio::sync::Mutex::new(())),
        })
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn create_pool(
        &self,
        _config: &ConnectionConfig,
        _settings: &PoolSettings,
    ) -> DbResult<Arc<dyn DriverPool>> {
        self.counters.pool_creates.fetch_add(1, Ordering::SeqCst);
        if self.script.pool_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.script.pool_delay).await;
        if let Some(msg) = self.script.pool_error.lock().unwrap().clone() {
            return Err(crate::error::classify(msg));
        }
        Ok(Arc::new(ScriptedPool { driver: self.clone() }))
    }

    async fn connect(&self, config: &ConnectionConfig) -> DbResult<Box<dyn Session>> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_order.lock().unwrap().push(config.id.clone());
        tokio::time::sleep(self.script.connect_delay).await;
        let failing = self
            .script
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let msg = self
                .script
                .connect_error
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "ORA-12541: TNS:no listener".to_string());
            return Err(crate::error::classify(msg));
        }
        Ok(self.session())
    }
}

#[derive(Clone)]
pub struct ScriptedPool {
    driver: ScriptedDriver,
}

impl std::fmt::Debug for ScriptedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScriptedPool")
    }
}

#[async_trait]
impl DriverPool for ScriptedPool {
    async fn get(&self) -> DbResult<Box<dyn Session>> {
        self.driver.counters.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.driver.session())
    }

    async fn close(&self, _grace: Duration) -> DbResult<()> {
        self.driver.counters.pool_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedSession {
    counters: Arc<Counters>,
    script: Arc<Script>,
    statements: Arc<Mutex<Vec<StatementOptions>>>,
    /// Held by a statement that outlives its caller.
    busy: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for ScriptedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScriptedSession")
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn execute(
        &self,
        sql: &str,
        _binds: &Binds,
        options: &StatementOptions,
        cancel: CancellationToken,
    ) -> DbResult<QueryOutput> {
        self.statements.lock().unwrap().push(options.clone());
        if self.script.ignores_cancel.load(Ordering::SeqCst) {
            let guard = Arc::clone(&self.busy).lock_owned().await;
            let delay = self.script.exec_delay;
            let work = tokio::spawn(async move {
                let _busy = guard;
                tokio::time::sleep(delay).await;
            });
            let _ = work.await;
            return Ok(QueryOutput::default());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.script.exec_delay) => {}
            _ = cancel.cancelled() => {
                self.counters.interrupts.fetch_add(1, Ordering::SeqCst);
                return Err(DbError::UnknownBackend("ORA-01013: user requested cancel of current operation".into()));
            }
        }
        let responses = self.script.responses.lock().unwrap();
        responses
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| Ok(QueryOutput::default()))
    }

    async fn release(self: Box<Self>) -> DbResult<()> {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        let _idle = self.busy.lock().await;
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Build a single-row output from `(column, value)` pairs.
pub fn single_row(cells: &[(&str, Value)]) -> QueryOutput {
    QueryOutput {
        columns: cells
            .iter()
            .map(|(name, _)| ColumnMeta {
                name: name.to_string(),
                type_name: "VARCHAR2".into(),
                nullable: true,
            })
            .collect(),
        rows: vec![cells.iter().map(|(_, v)| v.clone()).collect()],
        ..Default::default()
    }
}

pub fn target(id: &str) -> ConnectionConfig {
    ConnectionConfig::new(id, "db.test", 1521, "ORCLPDB1", "monitor", "pw")
}
