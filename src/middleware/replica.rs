//! Replica routing for read queries.
//!
//! Claims a [`Replica`] configuration object whose connection matches the
//! call's connection, then tries the configured replicas (and possibly the
//! primary) in the order given by the [`Fallback`] strategy. A candidate that
//! fails with one of the retry kinds moves on to the next one. Any other
//! failure is returned immediately. When every candidate fails, the first
//! failure is returned.

use crate::context::Context;
use crate::error::{DbError, DbResult, ErrorKind};
use crate::middleware::{QueryMiddleware, QueryNext};
use crate::models::{Fallback, Query, Replica, ResultSet};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

const DEFAULT_RETRY_ON: [ErrorKind; 3] = [
    ErrorKind::Connection,
    ErrorKind::Deadlock,
    ErrorKind::Isolation,
];

#[derive(Debug)]
pub struct ReplicaMiddleware {
    replicas: HashMap<String, Vec<String>>,
    fallback: Fallback,
    retry_on: Vec<ErrorKind>,
    enabled: AtomicBool,
}

impl ReplicaMiddleware {
    pub fn new() -> Self {
        Self {
            replicas: HashMap::new(),
            fallback: Fallback::default(),
            retry_on: DEFAULT_RETRY_ON.to_vec(),
            enabled: AtomicBool::new(true),
        }
    }

    /// Add `replica` as a read replica of `primary`.
    pub fn replica(mut self, primary: impl Into<String>, replica: impl Into<String>) -> Self {
        self.replicas
            .entry(primary.into())
            .or_default()
            .push(replica.into());
        self
    }

    /// Add several read replicas of `primary`.
    pub fn replicas<I, S>(self, primary: impl Into<String>, replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let primary = primary.into();
        replicas
            .into_iter()
            .fold(self, |this, replica| this.replica(primary.clone(), replica))
    }

    /// Strategy used when the configuration object does not set one.
    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Error kinds that move on to the next candidate, unless overridden per call.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Route every query to its primary until [`ReplicaMiddleware::enable`] is called.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn replicas_of(&self, primary: &str) -> &[String] {
        self.replicas.get(primary).map(Vec::as_slice).unwrap_or_default()
    }

    /// Connections to try for `primary`, in order.
    ///
    /// A primary without replicas yields only itself.
    pub fn candidates(&self, primary: &str, fallback: Fallback) -> Vec<String> {
        let replicas = self.replicas_of(primary);
        if replicas.is_empty() {
            return vec![primary.to_string()];
        }

        let mut rng = rand::thread_rng();
        match fallback {
            Fallback::None => replicas.choose(&mut rng).cloned().into_iter().collect(),
            Fallback::Primary => replicas
                .choose(&mut rng)
                .cloned()
                .into_iter()
                .chain(std::iter::once(primary.to_string()))
                .collect(),
            Fallback::Any => {
                let mut candidates = replicas.to_vec();
                candidates.shuffle(&mut rng);
                candidates.push(primary.to_string());
                candidates
            }
            Fallback::Replicas => {
                let mut candidates = replicas.to_vec();
                candidates.shuffle(&mut rng);
                candidates
            }
        }
    }
}

impl Default for ReplicaMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryMiddleware for ReplicaMiddleware {
    async fn query(
        &self,
        query: Query,
        mut context: Context,
        next: QueryNext<'_>,
    ) -> DbResult<ResultSet> {
        let targets_this_call = context.peak::<Replica>().is_some_and(|replica| {
            replica
                .connection
                .as_deref()
                .is_none_or(|connection| connection == context.connection())
        });
        if !targets_this_call {
            return next.run(query, context).await;
        }
        let Some(config) = context.require::<Replica>()? else {
            return next.run(query, context).await;
        };

        let primary = context.connection().to_string();
        if !self.is_enabled() {
            debug!(connection = %primary, "Replicas disabled, using primary");
            return next.run(query, context).await;
        }
        if context.in_transaction_on(&primary) {
            debug!(connection = %primary, "Inside a transaction, using primary");
            return next.run(query, context).await;
        }

        let fallback = config.fallback.unwrap_or(self.fallback);
        let retry_on = config.retry_on.as_deref().unwrap_or(self.retry_on.as_slice());
        let candidates = self.candidates(&primary, fallback);
        debug!(
            connection = %primary,
            fallback = ?fallback,
            candidates = ?candidates,
            "Routing query to replicas"
        );

        let mut first_failure: Option<DbError> = None;
        for candidate in candidates {
            let attempt = context.with_connection(candidate.as_str());
            match next.run(query.clone(), attempt).await {
                Ok(result) => return Ok(result),
                Err(e) if retry_on.contains(&e.kind()) => {
                    warn!(
                        connection = %candidate,
                        error = %e,
                        "Replica candidate failed, trying next"
                    );
                    first_failure.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(first_failure.unwrap_or_else(|| {
            DbError::internal(format!("no replica candidates for '{primary}'"))
        }))
    }
}
