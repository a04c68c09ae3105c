//! Per-call configuration objects.
//!
//! Each type here is claimed by exactly one stage of the pipeline. Attach them
//! to a call through [`crate::context::Options`].

use crate::error::ErrorKind;
use crate::models::{IsolationLevel, TransactionScope};
use std::time::Duration;

/// Connection a query or statement is executed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub connection: String,
}

impl Target {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
        }
    }
}

/// Connections a `transactional` call opens a scope on.
///
/// Empty means the registry's default connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionTarget {
    pub connections: Vec<String>,
}

impl TransactionTarget {
    pub fn new<I, S>(connections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            connections: connections.into_iter().map(Into::into).collect(),
        }
    }
}

/// Which connections the replica middleware tries, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Fallback {
    /// One replica, no fallback.
    None,
    /// Every replica, then the primary.
    #[default]
    Any,
    /// One replica, then the primary.
    Primary,
    /// Every replica, never the primary.
    Replicas,
}

/// Request to serve a query from a replica of `connection`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    /// Primary whose replicas are used. `None` matches the call's connection.
    pub connection: Option<String>,
    /// Overrides the middleware's default strategy.
    pub fallback: Option<Fallback>,
    /// Overrides the error kinds that move on to the next candidate.
    pub retry_on: Option<Vec<ErrorKind>>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(connection: impl Into<String>) -> Self {
        Self {
            connection: Some(connection.into()),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = Some(kinds.into_iter().collect());
        self
    }
}

/// Run the call under a temporary isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Isolation {
    /// `None` leaves the current level untouched.
    pub level: Option<IsolationLevel>,
}

impl Isolation {
    pub fn new(level: IsolationLevel) -> Self {
        Self { level: Some(level) }
    }

    pub fn unchanged() -> Self {
        Self { level: None }
    }
}

/// Cache identity of a query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cache {
    pub key: String,
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl Cache {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
            tags: Vec::new(),
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Cache tags to drop once a statement succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidate {
    pub tags: Vec<String>,
}

impl Invalidate {
    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// Upper bound on the time spent in the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub duration: Duration,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

/// Per-call override of the connection's [`TransactionScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub rule: TransactionScope,
}

impl Scope {
    pub fn new(rule: TransactionScope) -> Self {
        Self { rule }
    }
}
