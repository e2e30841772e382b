//! In-process simulator.
//!
//! Produces plausible monitoring data with simulated latency so the rest of
//! the stack can run without a database. Pass a seed for reproducible
//! output.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::backend::Backend;
use crate::config::{ConnectionConfig, ExecutorSettings};
use crate::driver::{BindValue, Binds, ColumnMeta, QueryOutput, Value};
use crate::error::{DbError, DbResult};
use crate::executor::ExecuteOptions;
use crate::probe::{CapabilityTier, Edition, HealthResult};
use crate::queries::{self, ActiveSession, PlanStep, SqlStatistic, SqlText, WaitEvent};

const SQL_ID_ALPHABET: &[u8] = b"0123456789abcdfghjkmnpqrstuvwxyz";

const STATEMENTS: &[(&str, &str)] = &[
    ("APP", "SELECT o.order_id, o.status FROM orders o WHERE o.customer_id = :1"),
    ("APP", "UPDATE inventory SET qty = qty - :1 WHERE sku = :2"),
    ("APP", "INSERT INTO audit_log (event, created_at) VALUES (:1, SYSTIMESTAMP)"),
    ("REPORTING", "SELECT region, SUM(amount) FROM sales GROUP BY region"),
    ("REPORTING", "SELECT * FROM customers c JOIN orders o ON o.customer_id = c.id"),
    ("BATCH", "DELETE FROM session_cache WHERE expires_at < SYSDATE"),
];

const WAIT_EVENTS: &[(&str, &str)] = &[
    ("db file sequential read", "User I/O"),
    ("db file scattered read", "User I/O"),
    ("log file sync", "Commit"),
    ("enq: TX - row lock contention", "Application"),
    ("latch: shared pool", "Concurrency"),
    ("direct path read", "User I/O"),
    ("log file parallel write", "System I/O"),
    ("library cache lock", "Concurrency"),
];

const PROGRAMS: &[&str] = &["JDBC Thin Client", "sqlplus@app01", "python@worker02", "oracle@batch01"];

pub struct MockBackend {
    rng: Mutex<StdRng>,
    latency_ms: Range<u64>,
    /// Deadline for calls that carry no per-call timeout.
    default_timeout: Duration,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            latency_ms: 20..120,
            default_timeout: ExecutorSettings::default().default_timeout,
        }
    }

    pub fn with_latency(mut self, latency_ms: Range<u64>) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run `f` with the generator; never held across an await.
    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    /// Sleep for a simulated round trip, failing like a real statement when
    /// it outlasts `timeout`.
    async fn simulate_latency(&self, timeout: Duration) -> DbResult<Duration> {
        let latency = if self.latency_ms.is_empty() {
            Duration::ZERO
        } else {
            Duration::from_millis(self.with_rng(|rng| rng.gen_range(self.latency_ms.clone())))
        };
        if tokio::time::timeout(timeout, tokio::time::sleep(latency)).await.is_err() {
            tracing::warn!(?timeout, ?latency, "simulated statement deadline reached");
            return Err(DbError::QueryTimeout { timeout });
        }
        Ok(latency)
    }

    fn sql_id(rng: &mut StdRng) -> String {
        (0..13)
            .map(|_| SQL_ID_ALPHABET[rng.gen_range(0..SQL_ID_ALPHABET.len())] as char)
            .collect()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn is_dml(sql: &str) -> bool {
    let head = sql.trim_start().split_whitespace().next().unwrap_or_default();
    ["INSERT", "UPDATE", "DELETE", "MERGE"]
        .iter()
        .any(|kw| head.eq_ignore_ascii_case(kw))
}

fn is_plsql(sql: &str) -> bool {
    let head = sql.trim_start().split_whitespace().next().unwrap_or_default();
    head.eq_ignore_ascii_case("BEGIN") || head.eq_ignore_ascii_case("DECLARE")
}

fn out_binds(binds: &Binds) -> HashMap<String, Value> {
    let simulated = |bind: &BindValue| match bind {
        BindValue::In(_) => None,
        BindValue::OutText { .. } => Some(Value::from("MOCK")),
        BindValue::OutNumber => Some(Value::Int(0)),
    };
    match binds {
        Binds::None => HashMap::new(),
        Binds::Positional(values) => values
            .iter()
            .enumerate()
            .filter_map(|(i, b)| simulated(b).map(|v| ((i + 1).to_string(), v)))
            .collect(),
        Binds::Named(pairs) => pairs
            .iter()
            .filter_map(|(name, b)| simulated(b).map(|v| (name.clone(), v)))
            .collect(),
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute_query(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        binds: &Binds,
        options: &ExecuteOptions,
    ) -> DbResult<QueryOutput> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let elapsed = self.simulate_latency(timeout).await?;
        tracing::debug!(target_id = %config.id, binds = binds.len(), "mock statement");

        let mut output = QueryOutput {
            out_binds: out_binds(binds),
            elapsed,
            ..Default::default()
        };
        if is_dml(sql) {
            output.rows_affected = Some(self.with_rng(|rng| rng.gen_range(0..25)));
        } else if !is_plsql(sql) {
            output.columns = vec![
                ColumnMeta { name: "ID".into(), type_name: "NUMBER".into(), nullable: false },
                ColumnMeta { name: "VALUE".into(), type_name: "VARCHAR2".into(), nullable: true },
            ];
            let limit = options.max_rows.unwrap_or(1000);
            let count = self.with_rng(|rng| rng.gen_range(1..=10)).min(limit);
            output.rows = (1..=count as i64)
                .map(|i| vec![Value::Int(i), Value::from(format!("row-{i}"))])
                .collect();
        }
        Ok(output)
    }

    async fn health_check(&self, config: &ConnectionConfig) -> HealthResult {
        let elapsed = match self.simulate_latency(self.default_timeout).await {
            Ok(elapsed) => elapsed,
            Err(e) => return HealthResult::failed(self.default_timeout, &e),
        };
        HealthResult {
            is_healthy: true,
            elapsed_ms: elapsed.as_millis() as u64,
            version: Some("19c".into()),
            edition: Some(Edition::Enterprise),
            capability: CapabilityTier::Diagnostics,
            banner: Some("Oracle Database 19c Enterprise Edition Release 19.0.0.0.0 - Production".into()),
            instance_name: Some(config.service.to_ascii_uppercase()),
            status: Some("OPEN".into()),
            host_name: Some(config.host.clone()),
            error: None,
        }
    }

    async fn collect_sql_statistics(
        &self,
        _config: &ConnectionConfig,
        limit: u32,
    ) -> DbResult<Vec<SqlStatistic>> {
        self.simulate_latency(self.default_timeout).await?;
        let mut stats: Vec<SqlStatistic> = self.with_rng(|rng| {
            (0..queries::sql_limit(limit))
                .map(|_| {
                    let (schema, text) = STATEMENTS[rng.gen_range(0..STATEMENTS.len())];
                    let executions = rng.gen_range(1..50_000_i64);
                    let per_exec = rng.gen_range(0.05..250.0_f64);
                    let elapsed_ms = per_exec * executions as f64;
                    SqlStatistic {
                        sql_id: Self::sql_id(rng),
                        plan_hash_value: Some(rng.gen_range(100_000_000..4_000_000_000_i64)),
                        executions,
                        elapsed_ms,
                        cpu_ms: elapsed_ms * rng.gen_range(0.2..0.95),
                        buffer_gets: executions * rng.gen_range(3..2_000),
                        disk_reads: executions * rng.gen_range(0..50),
                        rows_processed: executions * rng.gen_range(0..20),
                        parsing_schema: Some(schema.into()),
                        module: Some("mock".into()),
                        sql_text: text.into(),
                    }
                })
                .collect()
        });
        stats.sort_by(|a, b| b.elapsed_ms.total_cmp(&a.elapsed_ms));
        Ok(stats)
    }

    async fn collect_wait_events(&self, _config: &ConnectionConfig) -> DbResult<Vec<WaitEvent>> {
        self.simulate_latency(self.default_timeout).await?;
        let mut events: Vec<WaitEvent> = self.with_rng(|rng| {
            WAIT_EVENTS
                .iter()
                .map(|(event, class)| {
                    let total_waits = rng.gen_range(10..1_000_000_i64);
                    let average_wait_ms = rng.gen_range(0.01..25.0_f64);
                    WaitEvent {
                        event: (*event).into(),
                        wait_class: (*class).into(),
                        total_waits,
                        time_waited_ms: average_wait_ms * total_waits as f64,
                        average_wait_ms,
                    }
                })
                .collect()
        });
        events.sort_by(|a, b| b.time_waited_ms.total_cmp(&a.time_waited_ms));
        Ok(events)
    }

    async fn collect_active_sessions(
        &self,
        _config: &ConnectionConfig,
    ) -> DbResult<Vec<ActiveSession>> {
        self.simulate_latency(self.default_timeout).await?;
        let mut sessions: Vec<ActiveSession> = self.with_rng(|rng| {
            let count = rng.gen_range(2..8);
            (0..count)
                .map(|_| {
                    let (schema, _) = STATEMENTS[rng.gen_range(0..STATEMENTS.len())];
                    let waiting = rng.gen_bool(0.6);
                    let (event, class) = WAIT_EVENTS[rng.gen_range(0..WAIT_EVENTS.len())];
                    ActiveSession {
                        sid: rng.gen_range(10..2_000),
                        serial: rng.gen_range(1..65_000),
                        username: Some(schema.into()),
                        status: "ACTIVE".into(),
                        program: PROGRAMS.choose(rng).map(|p| p.to_string()),
                        machine: Some(format!("app{:02}", rng.gen_range(1..6))),
                        sql_id: Some(Self::sql_id(rng)),
                        event: waiting.then(|| event.to_string()),
                        wait_class: waiting.then(|| class.to_string()),
                        last_call_et: rng.gen_range(0..600),
                        blocking_session: None,
                    }
                })
                .collect()
        });
        // The longest-running session is occasionally blocked by another.
        if sessions.len() > 1 && self.with_rng(|rng| rng.gen_bool(0.3)) {
            let blocker = sessions[1].sid;
            sessions[0].blocking_session = Some(blocker);
        }
        sessions.sort_by(|a, b| b.last_call_et.cmp(&a.last_call_et));
        Ok(sessions)
    }

    async fn collect_execution_plan(
        &self,
        _config: &ConnectionConfig,
        sql_id: &str,
        _plan_hash_value: Option<i64>,
    ) -> DbResult<Vec<PlanStep>> {
        self.simulate_latency(self.default_timeout).await?;
        tracing::debug!(sql_id, "mock execution plan");
        let step = |id: i64, parent: Option<i64>, depth: i64, operation: &str, options: Option<&str>, object: Option<&str>, cost: i64| PlanStep {
            id,
            parent_id: parent,
            depth,
            operation: operation.into(),
            options: options.map(Into::into),
            object_owner: object.map(|_| "APP".into()),
            object_name: object.map(Into::into),
            cost: Some(cost),
            cardinality: Some(cost * 12),
            bytes: Some(cost * 480),
            access_predicates: (operation == "HASH JOIN").then(|| "\"O\".\"CUSTOMER_ID\"=\"C\".\"ID\"".into()),
            filter_predicates: None,
        };
        Ok(vec![
            step(0, None, 0, "SELECT STATEMENT", None, None, 412),
            step(1, Some(0), 1, "HASH JOIN", None, None, 412),
            step(2, Some(1), 2, "TABLE ACCESS", Some("FULL"), Some("CUSTOMERS"), 37),
            step(3, Some(1), 2, "TABLE ACCESS", Some("FULL"), Some("ORDERS"), 371),
        ])
    }

    async fn get_sql_full_text(
        &self,
        _config: &ConnectionConfig,
        sql_id: &str,
    ) -> DbResult<Option<SqlText>> {
        self.simulate_latency(self.default_timeout).await?;
        let text = self.with_rng(|rng| STATEMENTS[rng.gen_range(0..STATEMENTS.len())].1);
        Ok(Some(SqlText {
            sql_id: sql_id.to_string(),
            text: text.to_string(),
            pieces: 1,
        }))
    }

    async fn close_pools(&self) -> usize {
        0
    }

    async fn close_pool(&self, _config: &ConnectionConfig) -> DbResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::target;

    #[tokio::test(start_paused = true)]
    async fn latency_is_simulated_within_range() {
        let backend = MockBackend::with_seed(7).with_latency(50..60);
        let started = tokio::time::Instant::now();
        let result = backend.health_check(&target("prod")).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(60));
        assert!(result.is_healthy);
        assert_eq!(result.instance_name.as_deref(), Some("ORCLPDB1"));
    }

    #[tokio::test(start_paused = true)]
    async fn top_sql_respects_limit_and_order() {
        let backend = MockBackend::with_seed(1);
        let stats = backend.collect_sql_statistics(&target("prod"), 15).await.unwrap();
        assert_eq!(stats.len(), 15);
        assert!(stats.windows(2).all(|w| w[0].elapsed_ms >= w[1].elapsed_ms));
        assert!(stats.iter().all(|s| s.sql_id.len() == 13));
    }

    #[tokio::test(start_paused = true)]
    async fn top_sql_limit_is_capped() {
        let backend = MockBackend::with_seed(1).with_latency(0..0);
        let stats = backend.collect_sql_statistics(&target("prod"), 5000).await.unwrap();
        assert_eq!(stats.len(), queries::MAX_SQL_LIMIT as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_statement_hits_its_deadline() {
        let backend = MockBackend::with_seed(5).with_latency(5000..5001);
        let options = ExecuteOptions::default().with_timeout(Duration::from_millis(10));

        let started = tokio::time::Instant::now();
        let err = backend
            .execute_query(&target("prod"), "SELECT 1 FROM dual", &Binds::None, &options)
            .await
            .unwrap_err();
        assert_eq!(err, DbError::QueryTimeout { timeout: Duration::from_millis(10) });
        assert_eq!(started.elapsed(), Duration::from_millis(10));

        let options = ExecuteOptions::default().with_timeout(Duration::from_secs(6));
        backend
            .execute_query(&target("prod"), "SELECT 1 FROM dual", &Binds::None, &options)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn default_deadline_applies_to_collectors_and_health() {
        let backend = MockBackend::with_seed(5)
            .with_latency(3000..3001)
            .with_default_timeout(Duration::from_secs(1));

        let err = backend.collect_wait_events(&target("prod")).await.unwrap_err();
        assert!(matches!(err, DbError::QueryTimeout { .. }));

        let health = backend.health_check(&target("prod")).await;
        assert!(!health.is_healthy);
        assert_eq!(health.elapsed_ms, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn same_seed_gives_same_data() {
        let a = MockBackend::with_seed(99).collect_wait_events(&target("prod")).await.unwrap();
        let b = MockBackend::with_seed(99).collect_wait_events(&target("prod")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), WAIT_EVENTS.len());
    }

    #[tokio::test(start_paused = true)]
    async fn statements_shape_follows_sql_kind() {
        let backend = MockBackend::with_seed(3).with_latency(0..0);
        let cfg = target("prod");

        let select = backend
            .execute_query(&cfg, "SELECT * FROM t", &Binds::None, &ExecuteOptions::default().with_max_rows(2))
            .await
            .unwrap();
        assert!(select.rows.len() <= 2 && !select.rows.is_empty());
        assert_eq!(select.rows_affected, None);

        let update = backend
            .execute_query(&cfg, "update t set x = 1", &Binds::None, &ExecuteOptions::default())
            .await
            .unwrap();
        assert!(update.rows.is_empty());
        assert!(update.rows_affected.is_some());

        let binds = Binds::named([
            ("id", BindValue::from(5_i64)),
            ("name", BindValue::OutText { max_len: 64 }),
        ]);
        let block = backend
            .execute_query(&cfg, "BEGIN lookup(:id, :name); END;", &binds, &ExecuteOptions::default())
            .await
            .unwrap();
        assert!(block.columns.is_empty());
        assert_eq!(block.out_binds.get("name"), Some(&Value::from("MOCK")));
        assert!(!block.out_binds.contains_key("id"));
    }
}
