//! Data models for the query pipeline.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod options;
pub mod query;

// Re-export commonly used types
pub use connection::{
    ConnectionConfig, ConnectionConfigError, DatabaseType, IsolationLevel, TransactionScope,
};
pub use options::{
    Cache, Fallback, Invalidate, Isolation, Replica, Scope, Target, Timeout, TransactionTarget,
};
pub use query::{DEFAULT_QUERY_TIMEOUT_SECS, Query, QueryParam, ResultSet, Row, Variables};
