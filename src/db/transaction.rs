//! Transaction coordination across connections.
//!
//! A [`TransactionStack`] is shared by one call tree: the outermost
//! `transactional()` creates it and nested calls made through the bound
//! executor reuse it. It records which connections have an open scope and how
//! deeply nested each one is.
//!
//! A [`LogicalTransaction`] is one `transactional()` invocation. It opens a
//! scope per requested connection, owning the ones it actually began, and
//! commits or rolls back only those. Scopes inherited from an outer call are
//! just unwound.

use crate::db::{Adapter, AdapterRegistry};
use crate::error::{DbError, DbResult, RollbackFailure};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// One connection's open scope inside a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenScope {
    pub connection: String,
    /// Number of logical transactions currently inside this scope.
    pub depth: usize,
}

#[derive(Debug)]
pub struct TransactionStack {
    id: String,
    started_at: DateTime<Utc>,
    scopes: Mutex<Vec<OpenScope>>,
}

impl TransactionStack {
    pub fn new() -> Self {
        Self {
            id: generate_transaction_id(),
            started_at: Utc::now(),
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn scopes(&self) -> MutexGuard<'_, Vec<OpenScope>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if `connection` has an open scope.
    pub fn contains(&self, connection: &str) -> bool {
        self.scopes().iter().any(|s| s.connection == connection)
    }

    /// Nesting depth of `connection`, 0 when it has no open scope.
    pub fn depth(&self, connection: &str) -> usize {
        self.scopes()
            .iter()
            .find(|s| s.connection == connection)
            .map_or(0, |s| s.depth)
    }

    /// Open scopes in the order they were opened.
    pub fn snapshot(&self) -> Vec<OpenScope> {
        self.scopes().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes().is_empty()
    }

    /// Join an already open scope. Returns false if there is none.
    fn enter(&self, connection: &str) -> bool {
        match self.scopes().iter_mut().find(|s| s.connection == connection) {
            Some(scope) => {
                scope.depth += 1;
                true
            }
            None => false,
        }
    }

    fn push(&self, connection: &str) {
        self.scopes().push(OpenScope {
            connection: connection.to_string(),
            depth: 1,
        });
    }

    fn leave(&self, connection: &str) {
        if let Some(scope) = self.scopes().iter_mut().find(|s| s.connection == connection) {
            scope.depth = scope.depth.saturating_sub(1);
        }
    }

    fn close(&self, connection: &str) {
        self.scopes().retain(|s| s.connection != connection);
    }
}

impl Default for TransactionStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a logical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Open,
    Committing,
    RollingBack,
    Closed,
}

#[derive(Debug)]
struct Participant {
    connection: String,
    adapter: Arc<dyn Adapter>,
    /// True if this logical transaction began the adapter transaction.
    owned: bool,
}

/// One `transactional()` invocation.
///
/// Dropping it before commit or rollback finished (its future was cancelled)
/// unwinds its scopes and rolls back the connections it owns on a spawned
/// task.
#[derive(Debug)]
pub struct LogicalTransaction {
    stack: Arc<TransactionStack>,
    participants: Vec<Participant>,
    state: TransactionState,
}

impl LogicalTransaction {
    pub fn new(stack: Arc<TransactionStack>) -> Self {
        Self {
            stack,
            participants: Vec::new(),
            state: TransactionState::Idle,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Connections this call began, in opening order.
    pub fn owned(&self) -> Vec<&str> {
        self.participants
            .iter()
            .filter(|p| p.owned)
            .map(|p| p.connection.as_str())
            .collect()
    }

    /// Open a scope on every connection, in order.
    ///
    /// If a connection cannot be opened, the scopes opened so far are rolled
    /// back. When this call had not begun any connection yet, joined scopes
    /// are unwound and the failure is returned as is.
    pub async fn open(&mut self, registry: &AdapterRegistry, connections: &[String]) -> DbResult<()> {
        for connection in connections {
            if let Err(e) = self.open_one(registry, connection).await {
                if self.owned().is_empty() {
                    for participant in self.participants.drain(..).rev() {
                        self.stack.leave(&participant.connection);
                    }
                    self.state = TransactionState::Closed;
                    return Err(e);
                }
                return Err(self.rollback(e).await);
            }
        }
        self.state = TransactionState::Open;
        debug!(
            transaction_id = %self.stack.id(),
            owned = ?self.owned(),
            "Logical transaction open"
        );
        Ok(())
    }

    async fn open_one(&mut self, registry: &AdapterRegistry, connection: &str) -> DbResult<()> {
        let entry = registry.get(connection)?;
        let adapter = Arc::clone(entry.adapter());
        if self.stack.enter(connection) {
            debug!(
                transaction_id = %self.stack.id(),
                connection = %connection,
                depth = self.stack.depth(connection),
                "Joined open transaction scope"
            );
            self.participants.push(Participant {
                connection: connection.to_string(),
                adapter,
                owned: false,
            });
            return Ok(());
        }

        if !adapter.supports_transactions() {
            return Err(DbError::unsupported("transactions", connection));
        }
        adapter.begin(self.stack.id()).await?;
        self.stack.push(connection);
        self.participants.push(Participant {
            connection: connection.to_string(),
            adapter,
            owned: true,
        });
        info!(
            transaction_id = %self.stack.id(),
            connection = %connection,
            "Transaction started"
        );
        Ok(())
    }

    /// Commit owned connections in opening order and unwind inherited ones.
    ///
    /// A failed commit rolls back everything not yet committed, including
    /// the connection whose commit failed.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.state = TransactionState::Committing;
        while let Some(first) = self.participants.first() {
            let connection = first.connection.clone();
            if !first.owned {
                self.stack.leave(&connection);
                self.participants.remove(0);
                continue;
            }

            let adapter = Arc::clone(&first.adapter);
            if let Err(e) = adapter.commit(self.stack.id()).await {
                warn!(
                    transaction_id = %self.stack.id(),
                    connection = %connection,
                    error = %e,
                    "Commit failed, rolling back"
                );
                return Err(self.rollback(e).await);
            }

            self.participants.remove(0);
            self.stack.close(&connection);
            info!(
                transaction_id = %self.stack.id(),
                connection = %connection,
                "Transaction committed"
            );
        }
        self.state = TransactionState::Closed;
        Ok(())
    }

    /// Roll back owned connections in reverse opening order and build the
    /// error to surface for `cause`.
    pub async fn rollback(&mut self, cause: DbError) -> DbError {
        self.state = TransactionState::RollingBack;
        let mut failures = Vec::new();

        while let Some(last) = self.participants.last() {
            let connection = last.connection.clone();
            if !last.owned {
                self.stack.leave(&connection);
                self.participants.pop();
                continue;
            }

            let adapter = Arc::clone(&last.adapter);
            let rolled_back = adapter.rollback(self.stack.id()).await;
            self.participants.pop();
            self.stack.close(&connection);
            match rolled_back {
                Ok(()) => info!(
                    transaction_id = %self.stack.id(),
                    connection = %connection,
                    "Transaction rolled back"
                ),
                Err(error) => failures.push(RollbackFailure { connection, error }),
            }
        }
        self.state = TransactionState::Closed;

        if failures.is_empty() {
            return DbError::rollback(cause);
        }
        error!(
            transaction_id = %self.stack.id(),
            cause = %cause,
            failed = failures.len(),
            "Rollback failed on participating connections"
        );
        DbError::distributed_rollback(cause, failures)
    }
}

impl Drop for LogicalTransaction {
    fn drop(&mut self) {
        if self.participants.is_empty() {
            return;
        }
        warn!(
            transaction_id = %self.stack.id(),
            state = ?self.state,
            pending = ?self.participants.iter().map(|p| p.connection.as_str()).collect::<Vec<_>>(),
            "Logical transaction dropped without commit or rollback"
        );

        let mut orphaned = Vec::new();
        for participant in self.participants.drain(..).rev() {
            if participant.owned {
                self.stack.close(&participant.connection);
                orphaned.push(participant);
            } else {
                self.stack.leave(&participant.connection);
            }
        }
        if orphaned.is_empty() {
            return;
        }

        let id = self.stack.id().to_string();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(rollback_orphaned(id, orphaned));
            }
            Err(_) => error!(
                transaction_id = %id,
                "No runtime to roll back a dropped transaction, connections stay open"
            ),
        }
    }
}

/// Roll back, in the given order, the connections a dropped logical
/// transaction owned.
async fn rollback_orphaned(id: String, participants: Vec<Participant>) {
    for participant in participants {
        match participant.adapter.rollback(&id).await {
            Ok(()) => info!(
                transaction_id = %id,
                connection = %participant.connection,
                "Dropped transaction rolled back"
            ),
            Err(e) => error!(
                transaction_id = %id,
                connection = %participant.connection,
                error = %e,
                "Failed to roll back dropped transaction"
            ),
        }
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32); // "tx_" + 32 hex chars
    }

    #[test]
    fn test_stack_nesting() {
        let stack = TransactionStack::new();
        assert!(!stack.enter("main"));
        stack.push("main");
        assert_eq!(stack.depth("main"), 1);

        assert!(stack.enter("main"));
        assert_eq!(stack.depth("main"), 2);
        stack.leave("main");
        assert_eq!(stack.depth("main"), 1);
        assert!(stack.contains("main"));

        stack.close("main");
        assert!(!stack.contains("main"));
        assert_eq!(stack.depth("main"), 0);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_snapshot_keeps_opening_order() {
        let stack = TransactionStack::new();
        stack.push("b");
        stack.push("a");
        let names: Vec<String> = stack.snapshot().into_iter().map(|s| s.connection).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_new_logical_transaction_is_idle() {
        let tx = LogicalTransaction::new(Arc::new(TransactionStack::new()));
        assert_eq!(tx.state(), TransactionState::Idle);
        assert!(tx.owned().is_empty());
    }
}
