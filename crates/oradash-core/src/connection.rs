//! Acquired connection handle.
//!
//! A [`Connection`] wraps one driver session plus whatever it borrowed: a
//! pool key for pooled sessions, a gate permit for direct sessions. Exactly
//! one of [`Connection::release`] or [`Connection::close`] ends its life; if
//! neither runs (the owning future was dropped mid-flight) the drop handler
//! closes the session in the background so nothing leaks.

use tokio_util::sync::CancellationToken;

use crate::config::PoolKey;
use crate::driver::{Binds, QueryOutput, Session, StatementOptions};
use crate::error::{DbError, DbResult};
use crate::gate::GatePermit;

/// Where a connection came from, which decides what release means.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    Pooled(PoolKey),
    Direct,
}

pub struct Connection {
    session: Option<Box<dyn Session>>,
    kind: ConnectionKind,
    permit: Option<GatePermit>,
}

impl Connection {
    pub(crate) fn pooled(session: Box<dyn Session>, key: PoolKey) -> Self {
        Self {
            session: Some(session),
            kind: ConnectionKind::Pooled(key),
            permit: None,
        }
    }

    pub(crate) fn direct(session: Box<dyn Session>, permit: GatePermit) -> Self {
        Self {
            session: Some(session),
            kind: ConnectionKind::Direct,
            permit: Some(permit),
        }
    }

    pub fn kind(&self) -> &ConnectionKind {
        &self.kind
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ConnectionKind::Direct
    }

    pub async fn execute(
        &self,
        sql: &str,
        binds: &Binds,
        options: &StatementOptions,
        cancel: CancellationToken,
    ) -> DbResult<QueryOutput> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| DbError::UnknownBackend("connection already released".into()))?;
        session.execute(sql, binds, options, cancel).await
    }

    /// Return the session to its pool, or close it and free the gate slot.
    pub async fn release(mut self) -> DbResult<()> {
        let result = match self.session.take() {
            Some(session) => session.release().await,
            None => Ok(()),
        };
        // Slot is freed only after the physical session is gone.
        self.permit.take();
        tracing::debug!(kind = ?self.kind, "connection released");
        result
    }

    /// Close the session without returning it to any reuse path.
    pub async fn close(mut self) -> DbResult<()> {
        let result = match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        };
        self.permit.take();
        tracing::debug!(kind = ?self.kind, "connection closed");
        result
    }

    /// Close without waiting. A driver call still running on the session
    /// finishes first, and the gate slot stays held until the close is done.
    pub fn close_in_background(mut self) {
        tracing::debug!(kind = ?self.kind, "connection close deferred");
        self.spawn_close();
    }

    fn spawn_close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        tracing::warn!(error = %e, "background close failed");
                    }
                    drop(permit);
                });
            }
            Err(_) => drop(permit),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.session.is_some() {
            tracing::warn!(kind = ?self.kind, "connection dropped without release, closing");
            self.spawn_close();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("open", &self.session.is_some())
            .finish()
    }
}
