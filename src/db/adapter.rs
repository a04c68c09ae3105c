//! Adapter contract.
//!
//! An adapter executes resolved SQL against one named connection. It owns
//! pooling, classifies driver failures into [`DbError`] kinds, and exposes the
//! transaction and isolation primitives the core coordinates.
//!
//! Transactions are identified by the id of the logical transaction that
//! opened them, so independent call trees can each hold their own
//! transaction on the same connection.

use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, QueryParam, ResultSet};
use async_trait::async_trait;

/// Where an adapter runs a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    /// On a connection borrowed for this call only, switched to `isolation`
    /// for the duration of the call. `None` keeps the connection default.
    Autocommit { isolation: Option<IsolationLevel> },
    /// On the connection pinned by the transaction with this id.
    Transaction(String),
}

impl Session {
    pub fn autocommit() -> Self {
        Self::Autocommit { isolation: None }
    }

    pub fn transaction(id: impl Into<String>) -> Self {
        Self::Transaction(id.into())
    }

    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Self::Transaction(id) => Some(id),
            Self::Autocommit { .. } => None,
        }
    }

    /// Record `level` on an autocommit session. Transaction sessions keep
    /// their level on the adapter side.
    pub(crate) fn set_isolation(&mut self, level: IsolationLevel) {
        if let Self::Autocommit { isolation } = self {
            *isolation = Some(level);
        }
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Execute a read query.
    async fn query(&self, sql: &str, params: &[QueryParam], session: &Session)
    -> DbResult<ResultSet>;

    /// Execute a statement and return the number of affected rows.
    async fn statement(&self, sql: &str, params: &[QueryParam], session: &Session)
    -> DbResult<u64>;

    fn supports_transactions(&self) -> bool {
        false
    }

    /// Ids of the transactions currently open, in no particular order.
    async fn open_transactions(&self) -> Vec<String> {
        Vec::new()
    }

    async fn in_transaction(&self) -> bool {
        !self.open_transactions().await.is_empty()
    }

    /// Open the transaction `id` on a connection of its own.
    async fn begin(&self, _id: &str) -> DbResult<()> {
        Err(DbError::unsupported("transactions", "adapter"))
    }

    async fn commit(&self, _id: &str) -> DbResult<()> {
        Err(DbError::unsupported("transactions", "adapter"))
    }

    async fn rollback(&self, _id: &str) -> DbResult<()> {
        Err(DbError::unsupported("transactions", "adapter"))
    }

    /// Level calls in `session` currently run under.
    async fn isolation_level(&self, _session: &Session) -> DbResult<IsolationLevel> {
        Err(DbError::unsupported("isolation levels", "adapter"))
    }

    /// Switch `session` to `level`.
    ///
    /// A transaction session changes its pinned connection. An autocommit
    /// session carries its level itself, so here the adapter only confirms
    /// it can apply it.
    async fn set_isolation_level(&self, _session: &Session, _level: IsolationLevel) -> DbResult<()> {
        Err(DbError::unsupported("isolation levels", "adapter"))
    }

    /// Release pooled resources.
    async fn close(&self) {}
}

impl std::fmt::Debug for dyn Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Adapter")
    }
}
