//! Error types for the query pipeline.
//!
//! Every failure that crosses the pipeline is a [`DbError`]. Adapters classify
//! driver failures into this taxonomy before they reach the core, and
//! middlewares decide whether to retry based on [`DbError::kind`].

use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Deadlock detected: {message}")]
    Deadlock { message: String },

    #[error("Driver error: {message}")]
    Driver {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Syntax error: {message}")]
    Syntax { message: String },

    #[error("Isolation level error on '{connection}': {message}")]
    Isolation { connection: String, message: String },

    #[error("Logic error: {message}")]
    Logic { message: String },

    #[error("Unsupported: {capability} is not supported by connection '{connection}'")]
    Unsupported {
        capability: String,
        connection: String,
    },

    #[error("{what} '{name}' does not exist")]
    NotExists { what: &'static str, name: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Transaction rolled back: {source}")]
    RollbackTransaction {
        #[source]
        source: Box<DbError>,
    },

    #[error(
        "Distributed transaction rollback failed on {} connection(s) after: {cause}",
        .failures.len()
    )]
    DistributedTransactionRollback {
        #[source]
        cause: Box<DbError>,
        failures: Vec<RollbackFailure>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Stable classification of a [`DbError`], used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Deadlock,
    Driver,
    Syntax,
    Isolation,
    Logic,
    Unsupported,
    NotExists,
    Configuration,
    Timeout,
    RollbackTransaction,
    DistributedTransactionRollback,
    Internal,
}

/// A rollback that failed on one participating connection.
#[derive(Debug)]
pub struct RollbackFailure {
    pub connection: String,
    pub error: DbError,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.connection, self.error)
    }
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::Deadlock {
            message: message.into(),
        }
    }

    /// Create a driver error with optional SQL state.
    pub fn driver(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Driver {
            message: message.into(),
            sql_state,
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
        }
    }

    pub fn isolation(connection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Isolation {
            connection: connection.into(),
            message: message.into(),
        }
    }

    /// Create a logic error (API misuse, never retried).
    pub fn logic(message: impl Into<String>) -> Self {
        Self::Logic {
            message: message.into(),
        }
    }

    pub fn unsupported(capability: impl Into<String>, connection: impl Into<String>) -> Self {
        Self::Unsupported {
            capability: capability.into(),
            connection: connection.into(),
        }
    }

    /// Unknown connection name.
    pub fn not_exists(connection: impl Into<String>) -> Self {
        Self::NotExists {
            what: "Connection",
            name: connection.into(),
        }
    }

    /// Query source the parser could not find.
    pub fn source_not_found(source: impl Into<String>) -> Self {
        Self::NotExists {
            what: "Query source",
            name: source.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Wrap the failure that triggered a successful rollback.
    ///
    /// A failure that already reports a rollback (from a nested logical
    /// transaction) is returned unchanged.
    pub fn rollback(cause: DbError) -> Self {
        match cause {
            Self::RollbackTransaction { .. } => cause,
            other => Self::RollbackTransaction {
                source: Box::new(other),
            },
        }
    }

    /// Report rollback failures on one or more connections.
    pub fn distributed_rollback(cause: DbError, failures: Vec<RollbackFailure>) -> Self {
        Self::DistributedTransactionRollback {
            cause: Box::new(cause),
            failures,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Deadlock { .. } => ErrorKind::Deadlock,
            Self::Driver { .. } => ErrorKind::Driver,
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::Isolation { .. } => ErrorKind::Isolation,
            Self::Logic { .. } => ErrorKind::Logic,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::NotExists { .. } => ErrorKind::NotExists,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RollbackTransaction { .. } => ErrorKind::RollbackTransaction,
            Self::DistributedTransactionRollback { .. } => {
                ErrorKind::DistributedTransactionRollback
            }
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Deadlock { .. })
    }

    /// Rollback failures carried by a distributed rollback error.
    pub fn rollback_failures(&self) -> &[RollbackFailure] {
        match self {
            Self::DistributedTransactionRollback { failures, .. } => failures,
            _ => &[],
        }
    }

    /// The failure that triggered a rollback, if this error reports one.
    pub fn rollback_cause(&self) -> Option<&DbError> {
        match self {
            Self::RollbackTransaction { source } => Some(source),
            Self::DistributedTransactionRollback { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// SQLite result codes for SQLITE_BUSY and SQLITE_LOCKED (plus extended codes).
fn is_sqlite_lock_code(code: &str) -> bool {
    matches!(code, "5" | "6" | "261" | "262" | "517")
}

/// Classify a database-reported error by SQL state and message.
fn classify_database_error(message: &str, code: Option<String>) -> DbError {
    let lower = message.to_lowercase();
    match code.as_deref() {
        Some("40P01") | Some("40001") => DbError::deadlock(message),
        Some(c) if is_sqlite_lock_code(c) => DbError::deadlock(message),
        Some("42601") | Some("42000") => DbError::syntax(message),
        Some(c) if c.starts_with("08") => DbError::connection(
            message,
            "Check network connectivity and database server status",
        ),
        _ if lower.contains("syntax error") => DbError::syntax(message),
        _ if lower.contains("deadlock") || lower.contains("database is locked") => {
            DbError::deadlock(message)
        }
        _ => DbError::driver(message, code),
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                classify_database_error(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::driver("No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out acquiring a pooled connection",
                "Increase acquire_timeout or max_connections",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::driver(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::driver(format!("Failed to decode column {}: {}", index, source), None)
            }
            sqlx::Error::Decode(source) => DbError::driver(format!("Decode error: {}", source), None),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::driver(format!("Unknown database error: {}", err), None),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
