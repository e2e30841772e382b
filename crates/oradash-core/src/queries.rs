//! Monitoring query templates and the typed rows they map into.
//!
//! Every template is read-only and parameterised only by bind variables
//! (a row limit or a SQL id). Column names are matched case-insensitively,
//! so the mapping works with Oracle's upper-cased result metadata.

use serde::{Deserialize, Serialize};

use crate::driver::{BindValue, Binds, QueryOutput, Value};
use crate::error::{DbError, DbResult};

/// Rows returned by the top-SQL collector when the caller passes no limit.
pub const DEFAULT_SQL_LIMIT: u32 = 20;
/// Upper bound on top-SQL rows, shared by every backend.
pub const MAX_SQL_LIMIT: u32 = 1000;
const WAIT_EVENT_LIMIT: u32 = 50;

// ── Templates ─────────────────────────────────────────────────────

pub const TOP_SQL: &str = "\
SELECT * FROM (
    SELECT sql_id,
           plan_hash_value,
           executions,
           elapsed_time / 1000 AS elapsed_ms,
           cpu_time / 1000 AS cpu_ms,
           buffer_gets,
           disk_reads,
           rows_processed,
           parsing_schema_name,
           module,
           SUBSTR(sql_text, 1, 1000) AS sql_text
      FROM v$sql
     WHERE executions > 0
       AND parsing_schema_name NOT IN ('SYS', 'SYSTEM')
     ORDER BY elapsed_time DESC
) WHERE ROWNUM <= :limit";

pub const WAIT_EVENTS: &str = "\
SELECT * FROM (
    SELECT event,
           wait_class,
           total_waits,
           time_waited_micro / 1000 AS time_waited_ms,
           CASE WHEN total_waits > 0
                THEN time_waited_micro / 1000 / total_waits
                ELSE 0 END AS average_wait_ms
      FROM v$system_event
     WHERE wait_class <> 'Idle'
     ORDER BY time_waited_micro DESC
) WHERE ROWNUM <= :limit";

pub const ACTIVE_SESSIONS: &str = "\
SELECT sid,
       serial# AS serial,
       username,
       status,
       program,
       machine,
       sql_id,
       event,
       wait_class,
       last_call_et,
       blocking_session
  FROM v$session
 WHERE type = 'USER'
   AND status = 'ACTIVE'
   AND username IS NOT NULL
 ORDER BY last_call_et DESC";

pub const EXECUTION_PLAN: &str = "\
SELECT id, parent_id, depth, operation, options, object_owner, object_name,
       cost, cardinality, bytes, access_predicates, filter_predicates
  FROM v$sql_plan
 WHERE sql_id = :sql_id
   AND child_number = (SELECT MIN(child_number) FROM v$sql_plan WHERE sql_id = :sql_id)
 ORDER BY id";

pub const EXECUTION_PLAN_BY_HASH: &str = "\
SELECT id, parent_id, depth, operation, options, object_owner, object_name,
       cost, cardinality, bytes, access_predicates, filter_predicates
  FROM v$sql_plan
 WHERE sql_id = :sql_id
   AND plan_hash_value = :plan_hash_value
   AND child_number = (SELECT MIN(child_number) FROM v$sql_plan
                        WHERE sql_id = :sql_id AND plan_hash_value = :plan_hash_value)
 ORDER BY id";

pub const SQL_FULL_TEXT: &str = "\
SELECT piece, sql_text
  FROM v$sqltext_with_newlines
 WHERE sql_id = :sql_id
 ORDER BY piece";

/// Clamp a requested top-SQL row count into `1..=MAX_SQL_LIMIT`.
pub fn sql_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_SQL_LIMIT)
}

pub fn top_sql_binds(limit: u32) -> Binds {
    Binds::named([("limit", BindValue::from(i64::from(sql_limit(limit))))])
}

pub fn wait_event_binds() -> Binds {
    Binds::named([("limit", BindValue::from(i64::from(WAIT_EVENT_LIMIT)))])
}

/// Template and binds for a plan lookup, optionally pinned to one plan hash.
pub fn execution_plan_query(sql_id: &str, plan_hash_value: Option<i64>) -> (&'static str, Binds) {
    match plan_hash_value {
        Some(hash) => (
            EXECUTION_PLAN_BY_HASH,
            Binds::named([
                ("sql_id", BindValue::from(sql_id)),
                ("plan_hash_value", BindValue::from(hash)),
            ]),
        ),
        None => (EXECUTION_PLAN, Binds::named([("sql_id", BindValue::from(sql_id))])),
    }
}

pub fn sql_text_binds(sql_id: &str) -> Binds {
    Binds::named([("sql_id", BindValue::from(sql_id))])
}

// ── Row mapping ───────────────────────────────────────────────────

/// Read-only view of one row of a [`QueryOutput`].
#[derive(Clone, Copy)]
pub struct RowRef<'a> {
    output: &'a QueryOutput,
    index: usize,
}

impl<'a> RowRef<'a> {
    fn value(&self, column: &str) -> Option<&'a Value> {
        self.output.cell(self.index, column).filter(|v| !v.is_null())
    }

    pub fn text(&self, column: &str) -> Option<String> {
        self.value(column).and_then(Value::as_text)
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.value(column).and_then(Value::as_i64)
    }

    pub fn float(&self, column: &str) -> Option<f64> {
        self.value(column).and_then(Value::as_f64)
    }

    pub fn required_text(&self, column: &str) -> DbResult<String> {
        self.text(column)
            .ok_or_else(|| self.missing(column))
    }

    pub fn required_int(&self, column: &str) -> DbResult<i64> {
        match self.value(column) {
            Some(v) => v.as_i64().ok_or_else(|| {
                DbError::DataFormat(format!("column {column} is not numeric: {v:?}"))
            }),
            None => Err(self.missing(column)),
        }
    }

    fn missing(&self, column: &str) -> DbError {
        DbError::DataFormat(format!("row {} has no value for column {column}", self.index))
    }
}

/// Typed row built from a query result.
pub trait FromRow: Sized {
    fn from_row(row: RowRef<'_>) -> DbResult<Self>;
}

pub fn map_rows<T: FromRow>(output: &QueryOutput) -> DbResult<Vec<T>> {
    (0..output.rows.len())
        .map(|index| T::from_row(RowRef { output, index }))
        .collect()
}

// ── Typed rows ────────────────────────────────────────────────────

/// One statement from the shared SQL area, ranked by elapsed time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlStatistic {
    pub sql_id: String,
    pub plan_hash_value: Option<i64>,
    pub executions: i64,
    pub elapsed_ms: f64,
    pub cpu_ms: f64,
    pub buffer_gets: i64,
    pub disk_reads: i64,
    pub rows_processed: i64,
    pub parsing_schema: Option<String>,
    pub module: Option<String>,
    /// First 1000 characters; see [`SqlText`] for the full statement.
    pub sql_text: String,
}

impl SqlStatistic {
    pub fn avg_elapsed_ms(&self) -> f64 {
        if self.executions > 0 {
            self.elapsed_ms / self.executions as f64
        } else {
            0.0
        }
    }
}

impl FromRow for SqlStatistic {
    fn from_row(row: RowRef<'_>) -> DbResult<Self> {
        Ok(Self {
            sql_id: row.required_text("sql_id")?,
            plan_hash_value: row.int("plan_hash_value"),
            executions: row.required_int("executions")?,
            elapsed_ms: row.float("elapsed_ms").unwrap_or_default(),
            cpu_ms: row.float("cpu_ms").unwrap_or_default(),
            buffer_gets: row.int("buffer_gets").unwrap_or_default(),
            disk_reads: row.int("disk_reads").unwrap_or_default(),
            rows_processed: row.int("rows_processed").unwrap_or_default(),
            parsing_schema: row.text("parsing_schema_name"),
            module: row.text("module"),
            sql_text: row.text("sql_text").unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitEvent {
    pub event: String,
    pub wait_class: String,
    pub total_waits: i64,
    pub time_waited_ms: f64,
    pub average_wait_ms: f64,
}

impl FromRow for WaitEvent {
    fn from_row(row: RowRef<'_>) -> DbResult<Self> {
        Ok(Self {
            event: row.required_text("event")?,
            wait_class: row.text("wait_class").unwrap_or_else(|| "Other".into()),
            total_waits: row.int("total_waits").unwrap_or_default(),
            time_waited_ms: row.float("time_waited_ms").unwrap_or_default(),
            average_wait_ms: row.float("average_wait_ms").unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveSession {
    pub sid: i64,
    pub serial: i64,
    pub username: Option<String>,
    pub status: String,
    pub program: Option<String>,
    pub machine: Option<String>,
    pub sql_id: Option<String>,
    pub event: Option<String>,
    pub wait_class: Option<String>,
    /// Seconds since the session's current call started.
    pub last_call_et: i64,
    pub blocking_session: Option<i64>,
}

impl FromRow for ActiveSession {
    fn from_row(row: RowRef<'_>) -> DbResult<Self> {
        Ok(Self {
            sid: row.required_int("sid")?,
            serial: row.required_int("serial")?,
            username: row.text("username"),
            status: row.text("status").unwrap_or_else(|| "ACTIVE".into()),
            program: row.text("program"),
            machine: row.text("machine"),
            sql_id: row.text("sql_id"),
            event: row.text("event"),
            wait_class: row.text("wait_class"),
            last_call_et: row.int("last_call_et").unwrap_or_default(),
            blocking_session: row.int("blocking_session"),
        })
    }
}

/// One operation of an execution plan, in `id` order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub depth: i64,
    pub operation: String,
    pub options: Option<String>,
    pub object_owner: Option<String>,
    pub object_name: Option<String>,
    pub cost: Option<i64>,
    pub cardinality: Option<i64>,
    pub bytes: Option<i64>,
    pub access_predicates: Option<String>,
    pub filter_predicates: Option<String>,
}

impl FromRow for PlanStep {
    fn from_row(row: RowRef<'_>) -> DbResult<Self> {
        Ok(Self {
            id: row.required_int("id")?,
            parent_id: row.int("parent_id"),
            depth: row.int("depth").unwrap_or_default(),
            operation: row.required_text("operation")?,
            options: row.text("options"),
            object_owner: row.text("object_owner"),
            object_name: row.text("object_name"),
            cost: row.int("cost"),
            cardinality: row.int("cardinality"),
            bytes: row.int("bytes"),
            access_predicates: row.text("access_predicates"),
            filter_predicates: row.text("filter_predicates"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlText {
    pub sql_id: String,
    pub text: String,
    pub pieces: usize,
}

impl SqlText {
    /// Reassemble a statement from its `v$sqltext_with_newlines` pieces.
    ///
    /// Returns `None` when the cursor has aged out of the shared pool.
    pub fn from_pieces(sql_id: &str, output: &QueryOutput) -> DbResult<Option<Self>> {
        let mut pieces = (0..output.rows.len())
            .map(|index| {
                let row = RowRef { output, index };
                Ok((row.required_int("piece")?, row.text("sql_text").unwrap_or_default()))
            })
            .collect::<DbResult<Vec<_>>>()?;
        if pieces.is_empty() {
            return Ok(None);
        }
        pieces.sort_by_key(|(piece, _)| *piece);
        Ok(Some(Self {
            sql_id: sql_id.to_string(),
            pieces: pieces.len(),
            text: pieces.into_iter().map(|(_, text)| text).collect(),
        }))
    }
}
