//! Database layer.
//!
//! The adapter contract and the connection-level machinery the pipeline
//! coordinates: registry, isolation bookkeeping and transaction stacks, plus
//! the sqlx-backed adapter.

pub mod adapter;
pub mod isolator;
mod params;
pub mod pool;
pub mod registry;
pub mod sqlx_adapter;
pub mod transaction;
pub mod types;

pub use adapter::{Adapter, Session};
pub use isolator::Isolator;
pub use pool::DbPool;
pub use registry::{AdapterRegistry, ConnectionEntry};
pub use sqlx_adapter::SqlxAdapter;
pub use transaction::{LogicalTransaction, OpenScope, TransactionStack, TransactionState};
