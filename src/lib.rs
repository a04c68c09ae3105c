//! Query Pipeline Library
//!
//! Runs SQL queries and statements against several named database
//! connections through a chain of middlewares. Calls carry typed
//! configuration objects that middlewares claim from the call [`Context`];
//! logical transactions span several connections and commit or roll back
//! them together.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod executor;
pub mod middleware;
pub mod models;
pub mod parser;

pub use config::Config;
pub use context::{Context, Options};
pub use db::{Adapter, AdapterRegistry, Isolator, Session, SqlxAdapter, TransactionStack};
pub use error::{DbError, DbResult, ErrorKind, RollbackFailure};
pub use executor::Executor;
pub use middleware::{Pipeline, QueryMiddleware, StatementMiddleware};
pub use models::{Query, QueryParam, ResultSet};
