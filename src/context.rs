//! Per-call execution context.
//!
//! Callers attach typed configuration objects to a call through [`Options`].
//! The executor turns them into a [`Context`] that travels down the
//! middleware chain. A middleware claims the object it understands with
//! [`Context::require`]; the terminal handler rejects the call if anything
//! is left unclaimed.
//!
//! Consumption is tracked by the position of the object in the call's own
//! option list, so two equal-looking objects are still two distinct claims.

use crate::db::{Session, TransactionStack};
use crate::error::{DbError, DbResult};
use std::any::{Any, TypeId, type_name};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
struct Attached {
    type_id: TypeId,
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Attached {
    fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            value: Arc::new(value),
        }
    }

    fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for Attached {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

/// Configuration objects attached to one call.
#[derive(Debug, Clone, Default)]
pub struct Options {
    items: Vec<Attached>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a configuration object.
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.push(value);
        self
    }

    pub fn push<T: Any + Send + Sync>(&mut self, value: T) {
        self.items.push(Attached::new(value));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove and return the first attached object of type `T`.
    pub(crate) fn take<T: Any + Send + Sync + Clone>(&mut self) -> Option<T> {
        let idx = self.items.iter().position(Attached::is::<T>)?;
        let attached = self.items.remove(idx);
        attached.value.downcast_ref::<T>().cloned()
    }

    pub(crate) fn type_names(&self) -> Vec<&'static str> {
        self.items.iter().map(|a| a.type_name).collect()
    }
}

/// Carrier of one call's configuration through the middleware chain.
///
/// Cloning (or [`Context::with_connection`]) forks the context: the fork
/// starts with the parent's consumption state and evolves independently, so
/// a middleware that retries `next` hands every attempt a fresh fork.
#[derive(Clone)]
pub struct Context {
    connection: String,
    options: Arc<[Attached]>,
    consumed: HashSet<usize>,
    transaction: Option<Arc<TransactionStack>>,
    /// Session chosen by a middleware, tied to the connection it was chosen for.
    session: Option<(String, Session)>,
}

impl Context {
    pub fn new(
        connection: impl Into<String>,
        options: Options,
        transaction: Option<Arc<TransactionStack>>,
    ) -> Self {
        Self {
            connection: connection.into(),
            options: options.items.into(),
            consumed: HashSet::new(),
            transaction,
            session: None,
        }
    }

    /// Connection the call currently targets.
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Fork with a different execution connection.
    pub fn with_connection(&self, connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            ..self.clone()
        }
    }

    /// Fork that runs on the current connection in `session`.
    pub fn with_session(&self, session: Session) -> Self {
        Self {
            session: Some((self.connection.clone(), session)),
            ..self.clone()
        }
    }

    /// Session chosen for the current connection, if a middleware chose one.
    pub fn session(&self) -> Option<&Session> {
        self.session
            .as_ref()
            .filter(|(connection, _)| *connection == self.connection)
            .map(|(_, session)| session)
    }

    /// Transaction stack of the logical transaction this call belongs to.
    pub fn transaction(&self) -> Option<&Arc<TransactionStack>> {
        self.transaction.as_ref()
    }

    /// True if the call belongs to a logical transaction that has `connection` open.
    pub fn in_transaction_on(&self, connection: &str) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(|stack| stack.contains(connection))
    }

    fn position<T: Any>(&self) -> Option<usize> {
        self.options.iter().position(Attached::is::<T>)
    }

    /// First attached object of type `T`, without claiming it.
    pub fn peak<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.position::<T>()
            .and_then(|idx| self.options[idx].value.downcast_ref::<T>())
    }

    /// Claim the first attached object of type `T`.
    ///
    /// Fails with a logic error if that object was already claimed, which
    /// means two middlewares are acting on the same configuration.
    pub fn require<T: Any + Send + Sync>(&mut self) -> DbResult<Option<Arc<T>>> {
        let Some(idx) = self.position::<T>() else {
            return Ok(None);
        };
        if !self.consumed.insert(idx) {
            return Err(DbError::logic(format!(
                "configuration {} already used by a previous middleware",
                self.options[idx].type_name
            )));
        }
        Ok(Arc::clone(&self.options[idx].value).downcast::<T>().ok())
    }

    /// True once every attached object has been claimed.
    pub fn depleted(&self) -> bool {
        self.consumed.len() == self.options.len()
    }

    fn unclaimed(&self) -> impl Iterator<Item = &Attached> + '_ {
        self.options
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.consumed.contains(idx))
            .map(|(_, attached)| attached)
    }

    /// Attached objects nobody claimed, in attachment order.
    pub fn unused(&self) -> impl Iterator<Item = &(dyn Any + Send + Sync)> + '_ {
        self.unclaimed().map(|attached| attached.value.as_ref())
    }

    /// Configuration error listing unclaimed objects, if any.
    pub fn ensure_depleted(&self) -> DbResult<()> {
        if self.depleted() {
            return Ok(());
        }
        let unused: Vec<&str> = self.unclaimed().map(|a| a.type_name).collect();
        Err(DbError::configuration(format!(
            "no middleware handled: {}",
            unused.join(", ")
        )))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("connection", &self.connection)
            .field("options", &self.options)
            .field("consumed", &self.consumed)
            .field("session", &self.session)
            .field(
                "transaction",
                &self.transaction.as_ref().map(|stack| stack.id().to_string()),
            )
            .finish()
    }
}
