//! Public entry point.
//!
//! The [`Executor`] builds a [`Context`] for every call, runs it through the
//! [`Pipeline`] and ends the chain with the adapter of the context's current
//! connection. `transactional` binds a clone of the executor to a
//! [`TransactionStack`] so that every call made through it, including nested
//! `transactional` calls, shares one call tree.

use crate::context::{Context, Options};
use crate::db::{AdapterRegistry, LogicalTransaction, Session, TransactionStack};
use crate::error::{DbError, DbResult};
use crate::middleware::{Pipeline, QueryHandler, StatementHandler};
use crate::models::{Query, ResultSet, Scope, Target, TransactionTarget};
use crate::parser::{QueryParser, RawParser};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Clone)]
pub struct Executor {
    registry: Arc<AdapterRegistry>,
    pipeline: Arc<Pipeline>,
    parser: Arc<dyn QueryParser>,
    transaction: Option<Arc<TransactionStack>>,
}

impl Executor {
    pub fn new(registry: Arc<AdapterRegistry>, pipeline: Pipeline) -> Self {
        Self {
            registry,
            pipeline: Arc::new(pipeline),
            parser: Arc::new(RawParser),
            transaction: None,
        }
    }

    /// Replace the parser that resolves query sources.
    pub fn with_parser(mut self, parser: Arc<dyn QueryParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Transaction stack this executor is bound to, if any.
    pub fn transaction(&self) -> Option<&Arc<TransactionStack>> {
        self.transaction.as_ref()
    }

    fn context(&self, mut options: Options) -> DbResult<Context> {
        let connection = match options.take::<Target>() {
            Some(target) => target.connection,
            None => self.registry.default_connection().to_string(),
        };
        self.registry.get(&connection)?;
        Ok(Context::new(connection, options, self.transaction.clone()))
    }

    fn terminal(&self) -> Terminal<'_> {
        Terminal {
            registry: &self.registry,
            parser: self.parser.as_ref(),
        }
    }

    /// Run a read query.
    pub async fn query(&self, query: impl Into<Query>, options: Options) -> DbResult<ResultSet> {
        let context = self.context(options)?;
        self.pipeline
            .run_query(&self.terminal(), query.into(), context)
            .await
    }

    /// Run a statement and return the number of affected rows.
    pub async fn statement(&self, query: impl Into<Query>, options: Options) -> DbResult<u64> {
        let context = self.context(options)?;
        self.pipeline
            .run_statement(&self.terminal(), query.into(), context)
            .await
    }

    /// Run `body` inside one logical transaction.
    ///
    /// `options` may carry a [`TransactionTarget`]; without one the default
    /// connection is used. Every owned connection is committed when `body`
    /// succeeds and rolled back when it fails. Connections already open in an
    /// enclosing `transactional` call are left to that call.
    pub async fn transactional<F, Fut, T>(&self, mut options: Options, body: F) -> DbResult<T>
    where
        F: FnOnce(Executor) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let target = options.take::<TransactionTarget>().unwrap_or_default();
        if !options.is_empty() {
            return Err(DbError::configuration(format!(
                "transactional() only accepts TransactionTarget, got: {}",
                options.type_names().join(", ")
            )));
        }

        let mut connections: Vec<String> = Vec::with_capacity(target.connections.len());
        for connection in target.connections {
            if !connections.contains(&connection) {
                connections.push(connection);
            }
        }
        if connections.is_empty() {
            connections.push(self.registry.default_connection().to_string());
        }

        let stack = self
            .transaction
            .clone()
            .unwrap_or_else(|| Arc::new(TransactionStack::new()));
        let mut transaction = LogicalTransaction::new(Arc::clone(&stack));
        transaction.open(&self.registry, &connections).await?;

        let bound = Executor {
            transaction: Some(stack),
            ..self.clone()
        };
        match body(bound).await {
            Ok(value) => {
                transaction.commit().await?;
                Ok(value)
            }
            Err(e) => Err(transaction.rollback(e).await),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry)
            .field("pipeline", &self.pipeline)
            .field(
                "transaction",
                &self.transaction.as_ref().map(|stack| stack.id().to_string()),
            )
            .finish()
    }
}

/// End of both chains: resolves the session, parses the source and calls
/// the adapter of the context's current connection.
struct Terminal<'a> {
    registry: &'a AdapterRegistry,
    parser: &'a dyn QueryParser,
}

impl Terminal<'_> {
    async fn prepare(&self, query: &Query, mut context: Context) -> DbResult<(String, Session)> {
        let scope = context.require::<Scope>()?;
        context.ensure_depleted()?;

        let session = match context.session() {
            Some(session) => session.clone(),
            None => {
                let entry = self.registry.get(context.connection())?;
                entry
                    .session_for(context.transaction().map(Arc::as_ref), scope.map(|s| s.rule))
                    .await?
            }
        };

        let sql = self.parser.parse(&query.source, &query.variables)?;
        Ok((sql, session))
    }
}

#[async_trait]
impl<'a> QueryHandler for Terminal<'a> {
    async fn handle_query(&self, query: Query, context: Context) -> DbResult<ResultSet> {
        let connection = context.connection().to_string();
        let (sql, session) = self.prepare(&query, context).await?;
        let adapter = self.registry.adapter(&connection)?;

        let start = Instant::now();
        let result = adapter.query(&sql, &query.params, &session).await;
        debug!(
            connection = %connection,
            session = ?session,
            sql = %sql,
            params = query.params.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Query executed"
        );
        result
    }
}

#[async_trait]
impl<'a> StatementHandler for Terminal<'a> {
    async fn handle_statement(&self, query: Query, context: Context) -> DbResult<u64> {
        let connection = context.connection().to_string();
        let (sql, session) = self.prepare(&query, context).await?;
        let adapter = self.registry.adapter(&connection)?;

        let start = Instant::now();
        let result = adapter.statement(&sql, &query.params, &session).await;
        debug!(
            connection = %connection,
            session = ?session,
            sql = %sql,
            params = query.params.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Statement executed"
        );
        result
    }
}
