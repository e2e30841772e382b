//! Driver seam: the traits the pool manager, gate and executor talk to.
//!
//! The real implementation wraps the Oracle client library
//! ([`crate::oracle_driver`]); tests inject scripted drivers. Three layers:
//!
//! ```text
//! Driver ── create_pool() ──→ DriverPool ── get() ──→ Session
//!        └─ connect() (direct, unpooled) ─────────────→ Session
//! ```
//!
//! Binds are carried through untouched; no SQL is parsed here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionConfig, PoolSettings};
use crate::error::DbResult;

/// A single cell or bind value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text form of the value; numbers are formatted, `Null` is `None`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// Integer view; text is parsed, floats are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse::<i64>().ok().or_else(|| {
                s.trim().parse::<f64>().ok().map(|f| f as i64)
            }),
            Value::Null => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Null => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A bind slot: an input value or an OUT placeholder filled by PL/SQL.
#[derive(Clone, Debug, PartialEq)]
pub enum BindValue {
    In(Value),
    OutText { max_len: u32 },
    OutNumber,
}

impl From<Value> for BindValue {
    fn from(v: Value) -> Self {
        BindValue::In(v)
    }
}

impl From<i64> for BindValue {
    fn from(v: i64) -> Self {
        BindValue::In(Value::Int(v))
    }
}

impl From<f64> for BindValue {
    fn from(v: f64) -> Self {
        BindValue::In(Value::Float(v))
    }
}

impl From<&str> for BindValue {
    fn from(v: &str) -> Self {
        BindValue::In(Value::from(v))
    }
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        BindValue::In(Value::Text(v))
    }
}

/// Statement binds, positional (`:1`, `:2`) or named (`:sql_id`).
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Binds {
    #[default]
    None,
    Positional(Vec<BindValue>),
    Named(Vec<(String, BindValue)>),
}

impl Binds {
    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<BindValue>,
    {
        Binds::Named(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<BindValue>,
    {
        Binds::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Binds::None => 0,
            Binds::Positional(v) => v.len(),
            Binds::Named(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Column metadata reported alongside rows.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

/// Result of executing one statement.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
    /// Rows touched by DML; `None` for queries.
    pub rows_affected: Option<u64>,
    /// OUT bind values keyed by bind name, or by 1-based position.
    pub out_binds: HashMap<String, Value>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl QueryOutput {
    /// Position of a column by case-insensitive name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Cell at `row` for the named column.
    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Per-statement knobs passed to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatementOptions {
    pub max_rows: usize,
    pub auto_commit: bool,
}

impl Default for StatementOptions {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            auto_commit: true,
        }
    }
}

/// A live database session, pooled or direct.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Execute one statement.
    ///
    /// When `cancel` fires the session must invoke the driver's interrupt
    /// primitive on the in-flight call before returning.
    async fn execute(
        &self,
        sql: &str,
        binds: &Binds,
        options: &StatementOptions,
        cancel: CancellationToken,
    ) -> DbResult<QueryOutput>;

    /// Hand the session back for reuse (pooled) or close it (direct).
    async fn release(self: Box<Self>) -> DbResult<()>;

    /// Close the session without returning it to any reuse path.
    ///
    /// A call still running after its `execute` future was dropped must
    /// return before the session is torn down.
    async fn close(self: Box<Self>) -> DbResult<()>;
}

/// A driver-managed pool for one [`crate::config::PoolKey`].
#[async_trait]
pub trait DriverPool: Send + Sync + fmt::Debug {
    /// Borrow a session, waiting up to the pool's queue timeout.
    async fn get(&self) -> DbResult<Box<dyn Session>>;

    /// Close the pool, letting busy sessions finish for up to `grace`.
    async fn close(&self, grace: Duration) -> DbResult<()>;
}

/// Factory for pools and direct sessions. Injected so tests can script it.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn create_pool(
        &self,
        config: &ConnectionConfig,
        settings: &PoolSettings,
    ) -> DbResult<Arc<dyn DriverPool>>;

    /// Open an unpooled session (privileged logons).
    async fn connect(&self, config: &ConnectionConfig) -> DbResult<Box<dyn Session>>;
}
