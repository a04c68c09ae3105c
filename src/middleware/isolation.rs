//! Temporary isolation level for one call.

use crate::context::Context;
use crate::db::{AdapterRegistry, Isolator};
use crate::error::DbResult;
use crate::middleware::{QueryMiddleware, QueryNext, StatementMiddleware, StatementNext};
use crate::models::{Isolation, Query, ResultSet, Scope};
use async_trait::async_trait;
use std::sync::Arc;

/// Claims [`Isolation`] and runs the rest of the chain under that level on
/// the call's current connection. The previous level is restored on every
/// exit path.
///
/// The level is tracked per call: inside a logical transaction it applies to
/// that transaction's pinned connection, otherwise it travels with the
/// call's autocommit session.
#[derive(Debug, Clone)]
pub struct IsolationMiddleware {
    registry: Arc<AdapterRegistry>,
}

impl IsolationMiddleware {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self { registry }
    }

    async fn isolator(&self, context: &Context) -> DbResult<Isolator> {
        let entry = self.registry.get(context.connection())?;
        let session = match context.session() {
            Some(session) => session.clone(),
            None => {
                let scope = context.peak::<Scope>().map(|s| s.rule);
                entry
                    .session_for(context.transaction().map(Arc::as_ref), scope)
                    .await?
            }
        };
        Ok(Isolator::new(
            entry.name(),
            Arc::clone(entry.adapter()),
            session,
        ))
    }
}

#[async_trait]
impl QueryMiddleware for IsolationMiddleware {
    async fn query(
        &self,
        query: Query,
        mut context: Context,
        next: QueryNext<'_>,
    ) -> DbResult<ResultSet> {
        let Some(isolation) = context.require::<Isolation>()? else {
            return next.run(query, context).await;
        };
        let isolator = self.isolator(&context).await?;
        isolator
            .isolated(isolation.level, |session| {
                next.run(query, context.with_session(session))
            })
            .await
    }
}

#[async_trait]
impl StatementMiddleware for IsolationMiddleware {
    async fn statement(
        &self,
        query: Query,
        mut context: Context,
        next: StatementNext<'_>,
    ) -> DbResult<u64> {
        let Some(isolation) = context.require::<Isolation>()? else {
            return next.run(query, context).await;
        };
        let isolator = self.isolator(&context).await?;
        isolator
            .isolated(isolation.level, |session| {
                next.run(query, context.with_session(session))
            })
            .await
    }
}
