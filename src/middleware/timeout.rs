//! Call-level deadline.

use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::middleware::{QueryMiddleware, QueryNext, StatementMiddleware, StatementNext};
use crate::models::{Query, ResultSet, Timeout};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

/// Bounds the time spent in the rest of the chain.
///
/// A [`Timeout`] configuration object wins over the middleware default.
/// Without either, calls are not bounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutMiddleware {
    default: Option<Duration>,
}

impl TimeoutMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(duration: Duration) -> Self {
        Self {
            default: Some(duration),
        }
    }

    fn limit(&self, context: &mut Context) -> DbResult<Option<Duration>> {
        Ok(context
            .require::<Timeout>()?
            .map(|t| t.duration)
            .or(self.default))
    }
}

async fn bounded<T, F>(operation: &str, limit: Option<Duration>, fut: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    let Some(limit) = limit else {
        return fut.await;
    };
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, timeout_ms = limit.as_millis() as u64, "Call timed out");
            Err(DbError::timeout(operation, limit))
        }
    }
}

#[async_trait]
impl QueryMiddleware for TimeoutMiddleware {
    async fn query(
        &self,
        query: Query,
        mut context: Context,
        next: QueryNext<'_>,
    ) -> DbResult<ResultSet> {
        let limit = self.limit(&mut context)?;
        bounded("query", limit, next.run(query, context)).await
    }
}

#[async_trait]
impl StatementMiddleware for TimeoutMiddleware {
    async fn statement(
        &self,
        query: Query,
        mut context: Context,
        next: StatementNext<'_>,
    ) -> DbResult<u64> {
        let limit = self.limit(&mut context)?;
        bounded("statement", limit, next.run(query, context)).await
    }
}
