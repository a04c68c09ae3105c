//! Isolation level bookkeeping for one call tree on one connection.
//!
//! An [`Isolator`] is bound to the [`Session`] its calls run in, so two call
//! trees on the same connection never see each other's changes. Every
//! [`Isolator::isolate`] pushes one entry and every [`Isolator::revert`] pops
//! one, so nested changes unwind in order. Use [`Isolator::isolated`] to get
//! the revert on every exit path.

use crate::db::{Adapter, Session};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::IsolationLevel;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// What a revert has to restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Revert {
    NoChange,
    PreviousLevel(IsolationLevel),
}

struct IsolatorState {
    session: Session,
    stack: Vec<Revert>,
}

pub struct Isolator {
    connection: String,
    adapter: Arc<dyn Adapter>,
    state: Mutex<IsolatorState>,
}

impl Isolator {
    pub fn new(connection: impl Into<String>, adapter: Arc<dyn Adapter>, session: Session) -> Self {
        Self {
            connection: connection.into(),
            adapter,
            state: Mutex::new(IsolatorState {
                session,
                stack: Vec::new(),
            }),
        }
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Session calls have to run in to observe the current level.
    pub async fn session(&self) -> Session {
        self.state.lock().await.session.clone()
    }

    /// Number of isolate calls not yet reverted.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.stack.len()
    }

    /// Switch to `level`, remembering how to undo it.
    pub async fn isolate(&self, level: Option<IsolationLevel>) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let Some(level) = level else {
            state.stack.push(Revert::NoChange);
            return Ok(());
        };

        let current = self
            .adapter
            .isolation_level(&state.session)
            .await
            .map_err(|e| self.classify(e))?;
        if current == level {
            state.stack.push(Revert::NoChange);
            return Ok(());
        }

        self.adapter
            .set_isolation_level(&state.session, level)
            .await
            .map_err(|e| self.classify(e))?;
        state.session.set_isolation(level);
        debug!(
            connection = %self.connection,
            from = %current,
            to = %level,
            "Isolation level changed"
        );
        state.stack.push(Revert::PreviousLevel(current));
        Ok(())
    }

    /// Undo the most recent [`Isolator::isolate`].
    pub async fn revert(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.stack.pop().ok_or_else(|| {
            DbError::logic(format!(
                "isolation revert without a matching isolate on '{}'",
                self.connection
            ))
        })?;
        let Revert::PreviousLevel(previous) = entry else {
            return Ok(());
        };

        let current = self
            .adapter
            .isolation_level(&state.session)
            .await
            .map_err(|e| self.classify(e))?;
        if current != previous {
            self.adapter
                .set_isolation_level(&state.session, previous)
                .await
                .map_err(|e| self.classify(e))?;
            state.session.set_isolation(previous);
            debug!(
                connection = %self.connection,
                from = %current,
                to = %previous,
                "Isolation level restored"
            );
        }
        Ok(())
    }

    /// Run `f` under `level` and revert afterwards, whatever `f` returns.
    ///
    /// `f` receives the session to run its calls in. When both `f` and the
    /// revert fail, `f`'s error wins and the revert error is logged.
    pub async fn isolated<F, Fut, T>(&self, level: Option<IsolationLevel>, f: F) -> DbResult<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.isolate(level).await?;
        let result = f(self.session().await).await;
        let reverted = self.revert().await;
        match (result, reverted) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(revert_err)) => {
                warn!(
                    connection = %self.connection,
                    error = %revert_err,
                    "Failed to revert isolation level after error"
                );
                Err(e)
            }
        }
    }

    fn classify(&self, err: DbError) -> DbError {
        match err.kind() {
            ErrorKind::Connection | ErrorKind::Isolation => err,
            _ => DbError::isolation(&self.connection, err.to_string()),
        }
    }
}

impl std::fmt::Debug for Isolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolator")
            .field("connection", &self.connection)
            .finish()
    }
}
