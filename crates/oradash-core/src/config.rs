//! Connection configuration, pool keys, and `oradash.toml` parsing.
//!
//! A [`ConnectionConfig`] identifies one monitored database target. Tuning
//! for the pool manager, direct gate, and executor lives in separate settings
//! structs so each component only sees what it needs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Session privilege requested at logon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Privilege {
    #[default]
    Normal,
    Sysdba,
    Sysoper,
}

impl Privilege {
    /// Privileged sessions bypass pooling and go through the direct gate.
    pub fn is_privileged(self) -> bool {
        !matches!(self, Privilege::Normal)
    }
}

impl std::fmt::Display for Privilege {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Privilege::Normal => write!(f, "NORMAL"),
            Privilege::Sysdba => write!(f, "SYSDBA"),
            Privilege::Sysoper => write!(f, "SYSOPER"),
        }
    }
}

/// How `service` is interpreted when building the connect descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    ServiceName,
    Sid,
}

/// Resolved connection details for one target. Immutable once resolved.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Target identity used by the config cache.
    pub id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Service name or SID, depending on `connection_type`.
    pub service: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub privilege: Privilege,
    #[serde(default)]
    pub connection_type: ConnectionType,
}

fn default_port() -> u16 {
    1521
}

impl ConnectionConfig {
    pub fn new(id: &str, host: &str, port: u16, service: &str, username: &str, password: &str) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
            service: service.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            privilege: Privilege::Normal,
            connection_type: ConnectionType::ServiceName,
        }
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    /// Connect string understood by the Oracle client.
    pub fn connect_string(&self) -> String {
        match self.connection_type {
            ConnectionType::ServiceName => format!("{}:{}/{}", self.host, self.port, self.service),
            ConnectionType::Sid => format!(
                "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST={})(PORT={}))(CONNECT_DATA=(SID={})))",
                self.host, self.port, self.service
            ),
        }
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            host: self.host.clone(),
            port: self.port,
            service: self.service.clone(),
            user: self.username.clone(),
            privilege: self.privilege,
        }
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("service", &self.service)
            .field("username", &self.username)
            .field("privilege", &self.privilege)
            .field("connection_type", &self.connection_type)
            .finish_non_exhaustive()
    }
}

/// Key identifying a connection pool. Configs with the same key share a pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub service: String,
    pub user: String,
    pub privilege: Privilege,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{}/{} ({})",
            self.user, self.host, self.port, self.service, self.privilege
        )
    }
}

/// Configuration for the pooled connection manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Connections opened when a pool is created (default: 1).
    pub min_size: u32,
    /// Maximum connections per pool key (default: 10).
    pub max_size: u32,
    /// Idle connections older than this are closed by the driver (default: 300s).
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    /// Maximum wait for a connection when the pool is exhausted (default: 10s).
    #[serde(with = "secs")]
    pub queue_timeout: Duration,
    /// Deadline for creating a pool (default: 30s).
    #[serde(with = "secs")]
    pub create_timeout: Duration,
    /// Grace period given to busy connections on close (default: 10s).
    #[serde(with = "secs")]
    pub close_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            idle_timeout: Duration::from_secs(300),
            queue_timeout: Duration::from_secs(10),
            create_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(10),
        }
    }
}

/// Configuration for the privileged direct-connection gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Ceiling on live direct connections (default: 3).
    pub max_concurrent: usize,
    /// How long a queued request may wait for a slot (default: 15s).
    #[serde(with = "secs")]
    pub queue_timeout: Duration,
    /// Physical connect attempts per admitted request (default: 3).
    pub max_retries: u32,
    /// Bound on a single connect attempt (default: 20s).
    #[serde(with = "secs")]
    pub attempt_timeout: Duration,
    /// Backoff unit; attempt `n` waits `n * retry_backoff` (default: 1s).
    #[serde(with = "secs")]
    pub retry_backoff: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            queue_timeout: Duration::from_secs(15),
            max_retries: 3,
            attempt_timeout: Duration::from_secs(20),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Configuration for the query executor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Default statement deadline (default: 10s).
    #[serde(with = "secs")]
    pub default_timeout: Duration,
    /// How long to wait for the driver to acknowledge an interrupt (default: 2s).
    #[serde(with = "secs")]
    pub cancel_grace: Duration,
    /// Default cap on fetched rows (default: 1000).
    pub max_rows: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(2),
            max_rows: 1000,
        }
    }
}

/// Startup flags selecting and initialising the backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Use the in-process simulator instead of a real database.
    pub mock: bool,
    /// Initialise the Oracle client library explicitly (extended client mode).
    pub extended_client: bool,
    /// Directory holding the Oracle client library, for extended client mode.
    pub client_lib_dir: Option<PathBuf>,
}

impl RuntimeSettings {
    /// Apply `ORADASH_MOCK`, `ORADASH_EXTENDED_CLIENT` and
    /// `ORADASH_CLIENT_LIB_DIR` on top of file values. `lookup` is usually
    /// `std::env::var`.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ORADASH_MOCK") {
            self.mock = parse_flag(&v);
        }
        if let Some(v) = lookup("ORADASH_EXTENDED_CLIENT") {
            self.extended_client = parse_flag(&v);
        }
        if let Some(v) = lookup("ORADASH_CLIENT_LIB_DIR") {
            if !v.is_empty() {
                self.client_lib_dir = Some(PathBuf::from(v));
            }
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Top-level `oradash.toml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OradashConfig {
    pub runtime: RuntimeSettings,
    pub pool: PoolSettings,
    pub gate: GateSettings,
    pub executor: ExecutorSettings,
    pub targets: Vec<ConnectionConfig>,
}

impl OradashConfig {
    pub fn from_file(path: &Path) -> DbResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DbError::Store(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> DbResult<Self> {
        toml::from_str(content).map_err(|e| DbError::Store(format!("invalid config: {e}")))
    }

    /// Targets indexed by id.
    pub fn target_map(&self) -> HashMap<String, ConnectionConfig> {
        self.targets
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect()
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
