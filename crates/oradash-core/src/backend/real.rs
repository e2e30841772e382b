//! Driver-backed backend.
//!
//! Owns the registry for the process: one pool manager, one direct gate and
//! the executor on top of them. Collectors are fixed templates from
//! [`crate::queries`] run through the executor and mapped into typed rows.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::Backend;
use crate::config::{ConnectionConfig, OradashConfig};
use crate::driver::{Binds, Driver, QueryOutput};
use crate::error::DbResult;
use crate::executor::{ExecuteOptions, QueryExecutor};
use crate::gate::DirectGate;
use crate::pool::ConnectionPoolManager;
use crate::probe::{HealthProbe, HealthResult};
use crate::queries::{
    self, ActiveSession, FromRow, PlanStep, SqlStatistic, SqlText, WaitEvent,
};

pub struct RealBackend {
    executor: Arc<QueryExecutor>,
    probe: HealthProbe,
}

impl RealBackend {
    pub fn new(config: &OradashConfig, driver: Arc<dyn Driver>) -> Self {
        let pools = Arc::new(ConnectionPoolManager::new(config.pool.clone(), driver.clone()));
        let gate = Arc::new(DirectGate::new(config.gate.clone(), driver));
        let executor = Arc::new(QueryExecutor::new(pools, gate, config.executor.clone()));
        Self {
            probe: HealthProbe::new(executor.clone()),
            executor,
        }
    }

    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    async fn collect<T: FromRow>(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        binds: &Binds,
        options: &ExecuteOptions,
    ) -> DbResult<Vec<T>> {
        let output = self.executor.execute(config, sql, binds, options).await?;
        queries::map_rows(&output)
    }
}

#[async_trait]
impl Backend for RealBackend {
    fn name(&self) -> &'static str {
        "oracle"
    }

    async fn execute_query(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        binds: &Binds,
        options: &ExecuteOptions,
    ) -> DbResult<QueryOutput> {
        self.executor.execute(config, sql, binds, options).await
    }

    async fn health_check(&self, config: &ConnectionConfig) -> HealthResult {
        self.probe.check(config).await
    }

    async fn collect_sql_statistics(
        &self,
        config: &ConnectionConfig,
        limit: u32,
    ) -> DbResult<Vec<SqlStatistic>> {
        let limit = queries::sql_limit(limit);
        let options = ExecuteOptions::default().with_max_rows(limit as usize);
        self.collect(config, queries::TOP_SQL, &queries::top_sql_binds(limit), &options)
            .await
    }

    async fn collect_wait_events(&self, config: &ConnectionConfig) -> DbResult<Vec<WaitEvent>> {
        self.collect(
            config,
            queries::WAIT_EVENTS,
            &queries::wait_event_binds(),
            &ExecuteOptions::default(),
        )
        .await
    }

    async fn collect_active_sessions(
        &self,
        config: &ConnectionConfig,
    ) -> DbResult<Vec<ActiveSession>> {
        self.collect(config, queries::ACTIVE_SESSIONS, &Binds::None, &ExecuteOptions::default())
            .await
    }

    async fn collect_execution_plan(
        &self,
        config: &ConnectionConfig,
        sql_id: &str,
        plan_hash_value: Option<i64>,
    ) -> DbResult<Vec<PlanStep>> {
        let (sql, binds) = queries::execution_plan_query(sql_id, plan_hash_value);
        self.collect(config, sql, &binds, &ExecuteOptions::default())
            .await
    }

    async fn get_sql_full_text(
        &self,
        config: &ConnectionConfig,
        sql_id: &str,
    ) -> DbResult<Option<SqlText>> {
        let output = self
            .executor
            .execute(
                config,
                queries::SQL_FULL_TEXT,
                &queries::sql_text_binds(sql_id),
                &ExecuteOptions::default(),
            )
            .await?;
        SqlText::from_pieces(sql_id, &output)
    }

    async fn close_pools(&self) -> usize {
        self.executor.gate().close();
        self.executor.pools().close_all().await
    }

    async fn close_pool(&self, config: &ConnectionConfig) -> DbResult<bool> {
        self.executor.pools().close(config).await
    }
}
