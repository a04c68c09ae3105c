//! Middleware pipeline.
//!
//! Two independent chains run around the adapter call: one for read queries,
//! returning a [`ResultSet`], and one for statements, returning the number of
//! affected rows. A middleware receives the query, the call's [`Context`] and
//! a [`QueryNext`] / [`StatementNext`] handle. It either calls `next.run(..)`,
//! possibly several times with forked contexts, or returns without calling it.
//!
//! The chain is assembled once with [`Pipeline`] and reused for every call.
//! Order matters: the first middleware added is the outermost.
//!
//! ```rust,ignore
//! let pipeline = Pipeline::new()
//!     .layer(TimeoutMiddleware::new())
//!     .query(ReplicaMiddleware::new().replica("main", "main-ro"))
//!     .layer(IsolationMiddleware::new(registry.clone()));
//! ```

mod cache;
mod isolation;
mod replica;
mod timeout;

pub use cache::{CacheMiddleware, MemoryCache, ResultCache};
pub use isolation::IsolationMiddleware;
pub use replica::ReplicaMiddleware;
pub use timeout::TimeoutMiddleware;

use crate::context::Context;
use crate::error::DbResult;
use crate::models::{Query, ResultSet};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait QueryMiddleware: Send + Sync {
    async fn query(&self, query: Query, context: Context, next: QueryNext<'_>)
    -> DbResult<ResultSet>;
}

#[async_trait]
pub trait StatementMiddleware: Send + Sync {
    async fn statement(&self, query: Query, context: Context, next: StatementNext<'_>)
    -> DbResult<u64>;
}

/// End of the query chain.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn handle_query(&self, query: Query, context: Context) -> DbResult<ResultSet>;
}

/// End of the statement chain.
#[async_trait]
pub trait StatementHandler: Send + Sync {
    async fn handle_statement(&self, query: Query, context: Context) -> DbResult<u64>;
}

/// Remainder of a query chain.
#[derive(Clone, Copy)]
pub struct QueryNext<'a> {
    chain: &'a [Arc<dyn QueryMiddleware>],
    handler: &'a dyn QueryHandler,
}

impl QueryNext<'_> {
    /// Invoke the rest of the chain.
    pub async fn run(self, query: Query, context: Context) -> DbResult<ResultSet> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = QueryNext {
                    chain: rest,
                    handler: self.handler,
                };
                middleware.query(query, context, next).await
            }
            None => self.handler.handle_query(query, context).await,
        }
    }
}

/// Remainder of a statement chain.
#[derive(Clone, Copy)]
pub struct StatementNext<'a> {
    chain: &'a [Arc<dyn StatementMiddleware>],
    handler: &'a dyn StatementHandler,
}

impl StatementNext<'_> {
    /// Invoke the rest of the chain.
    pub async fn run(self, query: Query, context: Context) -> DbResult<u64> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = StatementNext {
                    chain: rest,
                    handler: self.handler,
                };
                middleware.statement(query, context, next).await
            }
            None => self.handler.handle_statement(query, context).await,
        }
    }
}

/// Ordered query and statement middleware chains.
#[derive(Clone, Default)]
pub struct Pipeline {
    query: Vec<Arc<dyn QueryMiddleware>>,
    statement: Vec<Arc<dyn StatementMiddleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware to the query chain.
    pub fn query<M: QueryMiddleware + 'static>(mut self, middleware: M) -> Self {
        self.query.push(Arc::new(middleware));
        self
    }

    /// Append a middleware to the statement chain.
    pub fn statement<M: StatementMiddleware + 'static>(mut self, middleware: M) -> Self {
        self.statement.push(Arc::new(middleware));
        self
    }

    /// Append one middleware instance to both chains.
    pub fn layer<M>(mut self, middleware: M) -> Self
    where
        M: QueryMiddleware + StatementMiddleware + 'static,
    {
        let middleware = Arc::new(middleware);
        self.query.push(middleware.clone());
        self.statement.push(middleware);
        self
    }

    pub fn query_len(&self) -> usize {
        self.query.len()
    }

    pub fn statement_len(&self) -> usize {
        self.statement.len()
    }

    /// Run `query` through the query chain, ending in `handler`.
    pub async fn run_query(
        &self,
        handler: &dyn QueryHandler,
        query: Query,
        context: Context,
    ) -> DbResult<ResultSet> {
        let next = QueryNext {
            chain: &self.query,
            handler,
        };
        next.run(query, context).await
    }

    /// Run `query` through the statement chain, ending in `handler`.
    pub async fn run_statement(
        &self,
        handler: &dyn StatementHandler,
        query: Query,
        context: Context,
    ) -> DbResult<u64> {
        let next = StatementNext {
            chain: &self.statement,
            handler,
        };
        next.run(query, context).await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("query", &self.query.len())
            .field("statement", &self.statement.len())
            .finish()
    }
}
