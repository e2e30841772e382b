//! oradash-core: connection and session management for Oracle monitoring.
//!
//! Normal-privilege sessions come from lazily created per-key pools;
//! privileged (SYSDBA/SYSOPER) sessions go through a bounded direct-connect
//! gate with a FIFO wait queue and retry. Every statement runs under a hard
//! deadline with server-side cancellation.
//!
//! # Architecture
//!
//! ```text
//! caller
//!   └── ConfigResolver (TargetStore + 5 min TTL cache)
//!         └── dyn Backend  ── select_backend()
//!               ├── MockBackend (simulated rows + latency)
//!               └── RealBackend
//!                     ├── HealthProbe ─┐
//!                     └── QueryExecutor (deadline + CancellationToken)
//!                           ├── ConnectionPoolManager  (Normal)
//!                           └── DirectGate             (Sysdba / Sysoper)
//!                                 └── dyn Driver ── OracleDriver (spawn_blocking)
//! ```
//!
//! Every acquired [`Connection`] is released or closed exactly once. Health
//! failures are reported as data in [`HealthResult`], never as errors.

pub mod backend;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod executor;
pub mod gate;
pub mod oracle_driver;
pub mod pool;
pub mod probe;
pub mod queries;
pub mod resolver;

#[cfg(test)]
mod testing;

pub use backend::{Backend, MockBackend, RealBackend, select_backend};
pub use config::{ConnectionConfig, ConnectionType, OradashConfig, PoolKey, Privilege};
pub use connection::Connection;
pub use driver::{BindValue, Binds, QueryOutput, Value};
pub use error::{DbError, DbResult, ErrorKind};
pub use executor::{ExecuteOptions, QueryExecutor};
pub use gate::DirectGate;
pub use pool::ConnectionPoolManager;
pub use probe::{CapabilityTier, Edition, HealthProbe, HealthResult};
pub use resolver::{ConfigResolver, FileTargetStore, MemoryTargetStore, TargetStore};
