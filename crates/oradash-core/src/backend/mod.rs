//! Backend abstraction: one interface over a simulator and the real driver.
//!
//! Callers hold an `Arc<dyn Backend>` chosen once at startup by
//! [`select_backend`]. Nothing else in the crate branches on the mock flag.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ConnectionConfig, OradashConfig};
use crate::driver::{Binds, QueryOutput};
use crate::error::DbResult;
use crate::executor::ExecuteOptions;
use crate::oracle_driver::OracleDriver;
use crate::probe::HealthResult;
use crate::queries::{ActiveSession, PlanStep, SqlStatistic, SqlText, WaitEvent};

pub mod mock;
pub mod real;

pub use mock::MockBackend;
pub use real::RealBackend;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logs ("mock", "oracle").
    fn name(&self) -> &'static str;

    async fn execute_query(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        binds: &Binds,
        options: &ExecuteOptions,
    ) -> DbResult<QueryOutput>;

    /// Never fails; problems are reported inside the result.
    async fn health_check(&self, config: &ConnectionConfig) -> HealthResult;

    async fn collect_sql_statistics(
        &self,
        config: &ConnectionConfig,
        limit: u32,
    ) -> DbResult<Vec<SqlStatistic>>;

    async fn collect_wait_events(&self, config: &ConnectionConfig) -> DbResult<Vec<WaitEvent>>;

    async fn collect_active_sessions(
        &self,
        config: &ConnectionConfig,
    ) -> DbResult<Vec<ActiveSession>>;

    async fn collect_execution_plan(
        &self,
        config: &ConnectionConfig,
        sql_id: &str,
        plan_hash_value: Option<i64>,
    ) -> DbResult<Vec<PlanStep>>;

    /// `None` when the statement is no longer in the shared pool.
    async fn get_sql_full_text(
        &self,
        config: &ConnectionConfig,
        sql_id: &str,
    ) -> DbResult<Option<SqlText>>;

    /// Close every pool and stop accepting work. Returns the number of
    /// pools that failed to close cleanly.
    async fn close_pools(&self) -> usize;

    /// Close the pool serving `config`, if one exists.
    async fn close_pool(&self, config: &ConnectionConfig) -> DbResult<bool>;
}

/// Pick the backend for this process from the resolved runtime flags.
pub fn select_backend(config: &OradashConfig) -> Arc<dyn Backend> {
    if config.runtime.mock {
        tracing::info!(backend = "mock", "backend selected");
        Arc::new(MockBackend::new().with_default_timeout(config.executor.default_timeout))
    } else {
        let driver = Arc::new(OracleDriver::new(&config.runtime));
        tracing::info!(
            backend = "oracle",
            extended_client = driver.extended_client(),
            "backend selected"
        );
        Arc::new(RealBackend::new(config, driver))
    }
}
