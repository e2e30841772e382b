//! [`Driver`] implementation on top of the `oracle` crate (ODPI-C).
//!
//! The client library blocks, so every call runs on a `spawn_blocking`
//! thread. Cancellation goes through `break_execution`, which the client
//! library allows from a second thread while the first is blocked in a call.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oracle::sql_type::{OracleType, ToSql};
use oracle::{Connector, SqlValue};
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionConfig, PoolSettings, Privilege, RuntimeSettings};
use crate::driver::{
    BindValue, Binds, ColumnMeta, Driver, DriverPool, QueryOutput, Session, StatementOptions, Value,
};
use crate::error::{DbError, DbResult, classify};

fn driver_err(e: oracle::Error) -> DbError {
    classify(e.to_string())
}

async fn blocking<T, F>(f: F) -> DbResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> DbResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DbError::UnknownBackend(format!("driver task failed: {e}")))?
}

/// Initialise the client library explicitly. Failure is logged and the
/// driver falls back to the default library lookup.
pub fn init_extended_client(lib_dir: Option<&Path>) -> bool {
    let mut params = oracle::InitParams::new();
    if let Some(dir) = lib_dir {
        if let Err(e) = params.oracle_client_lib_dir(dir) {
            tracing::warn!(lib_dir = %dir.display(), error = %e, "invalid client library directory, using default mode");
            return false;
        }
    }
    match params.init() {
        Ok(_) => {
            tracing::info!(lib_dir = ?lib_dir, "extended client initialised");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "extended client initialisation failed, using default mode");
            false
        }
    }
}

pub struct OracleDriver {
    extended_client: bool,
}

impl OracleDriver {
    pub fn new(runtime: &RuntimeSettings) -> Self {
        let extended_client =
            runtime.extended_client && init_extended_client(runtime.client_lib_dir.as_deref());
        Self { extended_client }
    }

    /// Whether extended client mode is actually in effect.
    pub fn extended_client(&self) -> bool {
        self.extended_client
    }
}

#[async_trait]
impl Driver for OracleDriver {
    async fn create_pool(
        &self,
        config: &ConnectionConfig,
        settings: &PoolSettings,
    ) -> DbResult<Arc<dyn DriverPool>> {
        if config.privilege.is_privileged() {
            return Err(DbError::PrivilegedNotPoolable(config.pool_key().to_string()));
        }
        let username = config.username.clone();
        let password = config.password.clone();
        let connect_string = config.connect_string();
        let settings = settings.clone();

        let pool = blocking(move || {
            let mut builder = oracle::pool::PoolBuilder::new(username, password, connect_string);
            builder
                .min_connections(settings.min_size)
                .max_connections(settings.max_size)
                .connection_increment(1)
                .get_mode(oracle::pool::GetMode::TimedWait(settings.queue_timeout));
            builder.timeout(settings.idle_timeout).map_err(driver_err)?;
            builder.build().map_err(driver_err)
        })
        .await?;

        Ok(Arc::new(OraclePool {
            pool: Arc::new(pool),
            key: config.pool_key().to_string(),
        }))
    }

    async fn connect(&self, config: &ConnectionConfig) -> DbResult<Box<dyn Session>> {
        let username = config.username.clone();
        let password = config.password.clone();
        let connect_string = config.connect_string();
        let privilege = match config.privilege {
            Privilege::Sysdba => Some(oracle::Privilege::Sysdba),
            Privilege::Sysoper => Some(oracle::Privilege::Sysoper),
            Privilege::Normal => None,
        };

        let conn = blocking(move || {
            let mut connector = Connector::new(username, password, connect_string);
            if let Some(privilege) = privilege {
                connector.privilege(privilege);
            }
            connector.connect().map_err(driver_err)
        })
        .await?;

        Ok(Box::new(OracleSession::new(conn, false)))
    }
}

struct OraclePool {
    pool: Arc<oracle::pool::Pool>,
    key: String,
}

impl std::fmt::Debug for OraclePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OraclePool").field("key", &self.key).finish()
    }
}

#[async_trait]
impl DriverPool for OraclePool {
    async fn get(&self) -> DbResult<Box<dyn Session>> {
        let pool = Arc::clone(&self.pool);
        let conn = blocking(move || pool.get().map_err(driver_err)).await?;
        Ok(Box::new(OracleSession::new(conn, true)))
    }

    async fn close(&self, grace: Duration) -> DbResult<()> {
        let pool = Arc::clone(&self.pool);
        let graceful =
            blocking(move || pool.close(&oracle::pool::CloseMode::Default).map_err(driver_err)).await;
        if graceful.is_ok() {
            return Ok(());
        }

        // Busy sessions are still out; give them the grace period, then force.
        tracing::debug!(pool_key = %self.key, ?grace, "pool busy, waiting before forced close");
        tokio::time::sleep(grace).await;
        let pool = Arc::clone(&self.pool);
        blocking(move || pool.close(&oracle::pool::CloseMode::Force).map_err(driver_err)).await
    }
}

struct OracleSession {
    conn: Arc<oracle::Connection>,
    pooled: bool,
    /// Held by the blocking thread for the length of a driver call, which
    /// can outlive the `execute` future that started it.
    busy: Arc<tokio::sync::Mutex<()>>,
}

impl OracleSession {
    fn new(conn: oracle::Connection, pooled: bool) -> Self {
        Self {
            conn: Arc::new(conn),
            pooled,
            busy: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

impl std::fmt::Debug for OracleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleSession")
            .field("pooled", &self.pooled)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for OracleSession {
    async fn execute(
        &self,
        sql: &str,
        binds: &Binds,
        options: &StatementOptions,
        cancel: CancellationToken,
    ) -> DbResult<QueryOutput> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let binds = binds.clone();
        let options = options.clone();
        let busy = Arc::clone(&self.busy).lock_owned().await;
        let mut task = tokio::task::spawn_blocking(move || {
            let result = run_statement(&conn, &sql, &binds, &options);
            drop(conn);
            drop(busy);
            result
        });

        tokio::select! {
            joined = &mut task => return join_result(joined),
            _ = cancel.cancelled() => {}
        }

        let conn = Arc::clone(&self.conn);
        match blocking(move || conn.break_execution().map_err(driver_err)).await {
            Ok(()) => tracing::debug!("statement interrupted"),
            Err(e) => tracing::warn!(error = %e, "failed to interrupt statement"),
        }
        // The blocked call now returns with ORA-01013.
        join_result(task.await)
    }

    async fn release(self: Box<Self>) -> DbResult<()> {
        let OracleSession { conn, busy, .. } = *self;
        let _idle = busy.lock().await;
        // For pooled sessions close() hands the connection back to its pool.
        blocking(move || conn.close().map_err(driver_err)).await
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        let OracleSession { conn, pooled, busy } = *self;
        // A call cut loose by a missed deadline still owns the statement.
        let _idle = busy.lock().await;
        if pooled {
            blocking(move || {
                conn.close_with_mode(oracle::conn::CloseMode::Drop)
                    .map_err(driver_err)
            })
            .await
        } else {
            blocking(move || conn.close().map_err(driver_err)).await
        }
    }
}

fn join_result(
    joined: Result<DbResult<QueryOutput>, tokio::task::JoinError>,
) -> DbResult<QueryOutput> {
    joined.map_err(|e| DbError::UnknownBackend(format!("driver task failed: {e}")))?
}

/// Owned bind parameter, viewable as `&dyn ToSql`.
enum Param {
    Int(i64),
    Float(f64),
    Text(Option<String>),
    Out(OracleType),
}

impl Param {
    fn from_bind(bind: &BindValue) -> Self {
        match bind {
            BindValue::In(Value::Null) => Param::Text(None),
            BindValue::In(Value::Int(i)) => Param::Int(*i),
            BindValue::In(Value::Float(f)) => Param::Float(*f),
            BindValue::In(Value::Text(s)) => Param::Text(Some(s.clone())),
            BindValue::OutText { max_len } => Param::Out(OracleType::Varchar2(*max_len)),
            BindValue::OutNumber => Param::Out(OracleType::Number(0, 0)),
        }
    }

    fn as_sql(&self) -> &dyn ToSql {
        match self {
            Param::Int(v) => v,
            Param::Float(v) => v,
            Param::Text(v) => v,
            Param::Out(v) => v,
        }
    }
}

fn run_statement(
    conn: &oracle::Connection,
    sql: &str,
    binds: &Binds,
    options: &StatementOptions,
) -> DbResult<QueryOutput> {
    let mut builder = conn.statement(sql);
    builder.fetch_array_size(options.max_rows.clamp(1, 1000) as u32);
    let mut stmt = builder.build().map_err(driver_err)?;

    let positional: Vec<Param> = match binds {
        Binds::Positional(values) => values.iter().map(Param::from_bind).collect(),
        _ => Vec::new(),
    };
    let named: Vec<(&str, Param)> = match binds {
        Binds::Named(pairs) => pairs
            .iter()
            .map(|(name, bind)| (name.as_str(), Param::from_bind(bind)))
            .collect(),
        _ => Vec::new(),
    };
    let positional_refs: Vec<&dyn ToSql> = positional.iter().map(Param::as_sql).collect();
    let named_refs: Vec<(&str, &dyn ToSql)> =
        named.iter().map(|(name, p)| (*name, p.as_sql())).collect();

    let mut output = QueryOutput::default();

    if stmt.is_query() {
        let rows = match binds {
            Binds::Named(_) => stmt.query_named(&named_refs),
            _ => stmt.query(&positional_refs),
        }
        .map_err(driver_err)?;

        let types: Vec<OracleType> = rows
            .column_info()
            .iter()
            .map(|c| c.oracle_type().clone())
            .collect();
        output.columns = rows
            .column_info()
            .iter()
            .map(|c| ColumnMeta {
                name: c.name().to_string(),
                type_name: c.oracle_type().to_string(),
                nullable: c.nullable(),
            })
            .collect();

        for row in rows.take(options.max_rows) {
            let row = row.map_err(driver_err)?;
            let cells = row
                .sql_values()
                .iter()
                .zip(&types)
                .map(|(value, ty)| read_value(value, ty))
                .collect::<DbResult<Vec<_>>>()?;
            output.rows.push(cells);
        }
        return Ok(output);
    }

    match binds {
        Binds::Named(_) => stmt.execute_named(&named_refs),
        _ => stmt.execute(&positional_refs),
    }
    .map_err(driver_err)?;

    output.rows_affected = Some(stmt.row_count().map_err(driver_err)?);
    output.out_binds = read_out_binds(&stmt, binds)?;

    if options.auto_commit {
        conn.commit().map_err(driver_err)?;
    }
    Ok(output)
}

fn read_out_binds(stmt: &oracle::Statement, binds: &Binds) -> DbResult<HashMap<String, Value>> {
    let is_out = |b: &BindValue| !matches!(b, BindValue::In(_));
    let mut out = HashMap::new();
    match binds {
        Binds::Positional(values) => {
            for (i, _) in values.iter().enumerate().filter(|(_, b)| is_out(b)) {
                let raw: Option<String> = stmt.bind_value(i + 1).map_err(driver_err)?;
                out.insert((i + 1).to_string(), text_or_number(raw, &values[i]));
            }
        }
        Binds::Named(pairs) => {
            for (name, bind) in pairs.iter().filter(|(_, b)| is_out(b)) {
                let raw: Option<String> = stmt.bind_value(name.as_str()).map_err(driver_err)?;
                out.insert(name.clone(), text_or_number(raw, bind));
            }
        }
        Binds::None => {}
    }
    Ok(out)
}

fn text_or_number(raw: Option<String>, bind: &BindValue) -> Value {
    match (raw, bind) {
        (None, _) => Value::Null,
        (Some(s), BindValue::OutNumber) => parse_number(s),
        (Some(s), _) => Value::Text(s),
    }
}

fn parse_number(s: String) -> Value {
    if let Ok(i) = s.trim().parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = s.trim().parse::<f64>() {
        Value::Float(f)
    } else {
        Value::Text(s)
    }
}

fn read_value(value: &SqlValue, ty: &OracleType) -> DbResult<Value> {
    if value.is_null().map_err(driver_err)? {
        return Ok(Value::Null);
    }
    match ty {
        OracleType::Int64 => value.get::<i64>().map(Value::Int).map_err(driver_err),
        OracleType::BinaryFloat | OracleType::BinaryDouble | OracleType::Float(_) => {
            value.get::<f64>().map(Value::Float).map_err(driver_err)
        }
        OracleType::Number(..) => value.get::<String>().map(parse_number).map_err(driver_err),
        _ => value.get::<String>().map(Value::Text).map_err(driver_err),
    }
}
