//! Adapter registry.
//!
//! Maps connection names to adapters. Each registered connection carries a
//! [`TransactionScope`] rule that decides the [`Session`] of calls made
//! outside a logical transaction while the adapter has one open.

use crate::db::{Adapter, Session, TransactionStack};
use crate::error::{DbError, DbResult};
use crate::models::TransactionScope;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    name: String,
    adapter: Arc<dyn Adapter>,
    scope: TransactionScope,
}

impl ConnectionEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn scope(&self) -> TransactionScope {
        self.scope
    }

    /// Session a call on this connection runs in.
    ///
    /// Calls of a logical transaction that has this connection open run on
    /// its pinned connection. Other calls consult `scope`, or the
    /// connection's own rule, when the adapter has transactions open.
    pub async fn session_for(
        &self,
        stack: Option<&TransactionStack>,
        scope: Option<TransactionScope>,
    ) -> DbResult<Session> {
        if let Some(stack) = stack.filter(|stack| stack.contains(&self.name)) {
            return Ok(Session::transaction(stack.id()));
        }
        if !self.adapter.supports_transactions() {
            return Ok(Session::autocommit());
        }
        let open = self.adapter.open_transactions().await;
        if open.is_empty() {
            return Ok(Session::autocommit());
        }

        match scope.unwrap_or(self.scope) {
            TransactionScope::Independent => Ok(Session::autocommit()),
            TransactionScope::Forbid => Err(DbError::logic(format!(
                "connection '{}' has an open transaction and forbids joining it",
                self.name
            ))),
            TransactionScope::Join => match open.as_slice() {
                [id] => Ok(Session::transaction(id.as_str())),
                _ => Err(DbError::logic(format!(
                    "connection '{}' has {} open transactions, cannot pick one to join",
                    self.name,
                    open.len()
                ))),
            },
        }
    }
}

#[derive(Debug)]
pub struct AdapterRegistry {
    default: String,
    connections: HashMap<String, ConnectionEntry>,
}

impl AdapterRegistry {
    /// Create an empty registry whose default connection is `default`.
    ///
    /// The default must be registered before the registry is used.
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            connections: HashMap::new(),
        }
    }

    /// Register `adapter` under `name` with the default transaction scope.
    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn Adapter>) -> DbResult<()> {
        self.register_with_scope(name, adapter, TransactionScope::default())
    }

    pub fn register_with_scope(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn Adapter>,
        scope: TransactionScope,
    ) -> DbResult<()> {
        let name = name.into();
        if self.connections.contains_key(&name) {
            return Err(DbError::logic(format!(
                "connection '{name}' is already registered"
            )));
        }
        debug!(connection = %name, scope = ?scope, "Registering connection");
        self.connections.insert(
            name.clone(),
            ConnectionEntry {
                name,
                adapter,
                scope,
            },
        );
        Ok(())
    }

    /// Look up a connection.
    pub fn get(&self, name: &str) -> DbResult<&ConnectionEntry> {
        self.connections
            .get(name)
            .ok_or_else(|| DbError::not_exists(name))
    }

    pub fn adapter(&self, name: &str) -> DbResult<&Arc<dyn Adapter>> {
        self.get(name).map(ConnectionEntry::adapter)
    }

    pub fn default_connection(&self) -> &str {
        &self.default
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    /// Registered connection names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every registered adapter.
    pub async fn close_all(&self) {
        for name in self.names() {
            if let Some(entry) = self.connections.get(name) {
                info!(connection = %name, "Closing connection");
                entry.adapter.close().await;
            }
        }
        info!("All connections closed");
    }
}
