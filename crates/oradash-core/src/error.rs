//! Error taxonomy for the connection core.
//!
//! Driver failures arrive as free-form messages carrying Oracle error codes
//! (`ORA-01017`, `TNS-12541`, `DPI-1047`, ...). [`classify`] maps them onto
//! the user-facing kinds below; anything unrecognised passes through as
//! [`DbError::UnknownBackend`].

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for connection-core operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors surfaced by pool acquisition, direct connects, and execution.
///
/// `Clone` so a single pool-creation failure can be delivered to every
/// caller waiting on that creation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("connection config not found for target: {0}")]
    ConfigNotFound(String),

    #[error("pool creation for {key} did not complete within {timeout:?}")]
    PoolCreationTimeout { key: String, timeout: Duration },

    #[error("timed out after {waited:?} waiting for a direct connection slot")]
    DirectConnectQueueTimeout { waited: Duration },

    #[error("direct connection failed after {attempts} attempts: {last_error}")]
    DirectConnectExhausted { attempts: u32, last_error: String },

    #[error("query exceeded its {timeout:?} deadline and was cancelled")]
    QueryTimeout { timeout: Duration },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("database server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("service or SID not found: {0}")]
    ServiceNotFound(String),

    #[error("insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error("data format error: {0}")]
    DataFormat(String),

    #[error("privileged sessions cannot be pooled: {0}")]
    PrivilegedNotPoolable(String),

    #[error("connection manager is shutting down")]
    ShuttingDown,

    #[error("target store error: {0}")]
    Store(String),

    #[error("backend error: {0}")]
    UnknownBackend(String),
}

/// Stable, serialisable discriminant of [`DbError`] for callers that report
/// errors as data (health results, JSON output).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigNotFound,
    PoolCreationTimeout,
    DirectConnectQueueTimeout,
    DirectConnectExhausted,
    QueryTimeout,
    AuthenticationFailed,
    ServerUnreachable,
    ServiceNotFound,
    InsufficientPrivilege,
    DataFormatError,
    PrivilegedNotPoolable,
    ShuttingDown,
    Store,
    UnknownBackendError,
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::ConfigNotFound(_) => ErrorKind::ConfigNotFound,
            DbError::PoolCreationTimeout { .. } => ErrorKind::PoolCreationTimeout,
            DbError::DirectConnectQueueTimeout { .. } => ErrorKind::DirectConnectQueueTimeout,
            DbError::DirectConnectExhausted { .. } => ErrorKind::DirectConnectExhausted,
            DbError::QueryTimeout { .. } => ErrorKind::QueryTimeout,
            DbError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            DbError::ServerUnreachable(_) => ErrorKind::ServerUnreachable,
            DbError::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            DbError::InsufficientPrivilege(_) => ErrorKind::InsufficientPrivilege,
            DbError::DataFormat(_) => ErrorKind::DataFormatError,
            DbError::PrivilegedNotPoolable(_) => ErrorKind::PrivilegedNotPoolable,
            DbError::ShuttingDown => ErrorKind::ShuttingDown,
            DbError::Store(_) => ErrorKind::Store,
            DbError::UnknownBackend(_) => ErrorKind::UnknownBackendError,
        }
    }

    /// Whether the caller may safely retry the same request.
    ///
    /// Transient resource-pressure failures are retryable; configuration and
    /// credential failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::PoolCreationTimeout { .. }
                | DbError::DirectConnectQueueTimeout { .. }
                | DbError::DirectConnectExhausted { .. }
                | DbError::ServerUnreachable(_)
        )
    }
}

/// Classify a raw driver error message into a [`DbError`].
///
/// The message is kept intact in the payload so the original code stays
/// visible to operators.
pub fn classify(message: impl Into<String>) -> DbError {
    let message = message.into();
    let upper = message.to_ascii_uppercase();
    let has = |codes: &[&str]| codes.iter().any(|code| upper.contains(code));

    if has(&["ORA-01017", "ORA-28000", "ORA-28001", "ORA-01005", "ORA-01004"]) {
        DbError::AuthenticationFailed(message)
    } else if has(&["ORA-12514", "ORA-12505", "ORA-12515", "TNS-12514", "ORA-01034"]) {
        DbError::ServiceNotFound(message)
    } else if has(&[
        "ORA-12541", "ORA-12543", "ORA-12545", "ORA-12170", "ORA-12537", "ORA-03113",
        "ORA-03135", "TNS-12541", "TNS-12535", "DPI-1080", "CONNECTION REFUSED",
    ]) {
        DbError::ServerUnreachable(message)
    } else if has(&["ORA-01031", "ORA-01994", "ORA-00942", "ORA-01039"]) {
        DbError::InsufficientPrivilege(message)
    } else if has(&["ORA-01722", "ORA-01858", "ORA-01861", "ORA-01843", "ORA-06502", "ORA-12899"]) {
        DbError::DataFormat(message)
    } else {
        DbError::UnknownBackend(message)
    }
}
