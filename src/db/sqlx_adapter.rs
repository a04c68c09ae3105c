//! sqlx-backed adapter for PostgreSQL, MySQL and SQLite.
//!
//! Autocommit calls borrow a pooled connection for the duration of the call,
//! switching it to the session's isolation level and back. Each transaction
//! pins a pooled connection of its own from `begin` until `commit` or
//! `rollback`, keyed by the transaction id, so independent transactions on
//! one adapter never share a connection.

use crate::db::pool::DbPool;
use crate::db::types::RowToJson;
use crate::db::{Adapter, Session};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{ConnectionConfig, DatabaseType, IsolationLevel, QueryParam, ResultSet};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{MySql, Postgres, Sqlite};
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Pooled connection held for the duration of a call or a transaction.
enum PinnedConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl PinnedConnection {
    async fn acquire(pool: &DbPool) -> DbResult<Self> {
        Ok(match pool {
            DbPool::MySql(p) => Self::MySql(p.acquire().await?),
            DbPool::Postgres(p) => Self::Postgres(p.acquire().await?),
            DbPool::SQLite(p) => Self::SQLite(p.acquire().await?),
        })
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ResultSet> {
        match self {
            Self::MySql(conn) => mysql::fetch(conn, sql, params).await,
            Self::Postgres(conn) => postgres::fetch(conn, sql, params).await,
            Self::SQLite(conn) => sqlite::fetch(conn, sql, params).await,
        }
    }

    async fn statement(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        match self {
            Self::MySql(conn) => mysql::execute(conn, sql, params).await,
            Self::Postgres(conn) => postgres::execute(conn, sql, params).await,
            Self::SQLite(conn) => sqlite::execute(conn, sql, params).await,
        }
    }

    /// Run control statements that take no parameters, in order.
    async fn control(&mut self, statements: &[String]) -> DbResult<()> {
        for sql in statements {
            self.statement(sql, &[]).await?;
        }
        Ok(())
    }

    /// Drop the connection instead of returning it to the pool.
    fn discard(self) {
        match self {
            Self::MySql(conn) => drop(conn.detach()),
            Self::Postgres(conn) => drop(conn.detach()),
            Self::SQLite(conn) => drop(conn.detach()),
        }
    }
}

struct OpenTransaction {
    conn: PinnedConnection,
    isolation: IsolationLevel,
    /// True once a query or statement ran inside the transaction.
    used: bool,
}

/// Emptied by commit or rollback, so a call racing with them sees no
/// transaction instead of a finished connection.
type TransactionSlot = Arc<Mutex<Option<OpenTransaction>>>;

/// [`Adapter`] over a sqlx connection pool.
pub struct SqlxAdapter {
    id: String,
    pool: DbPool,
    default_isolation: IsolationLevel,
    transactions: std::sync::Mutex<HashMap<String, TransactionSlot>>,
}

impl SqlxAdapter {
    /// Wrap an existing pool.
    pub fn new(id: impl Into<String>, pool: DbPool) -> Self {
        let default_isolation = pool.db_type().default_isolation();
        Self {
            id: id.into(),
            pool,
            default_isolation,
            transactions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Create the pool described by `config` and wrap it.
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        let pool = DbPool::connect(config).await?;
        Ok(Self::new(config.id.clone(), pool))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    fn transactions(&self) -> MutexGuard<'_, HashMap<String, TransactionSlot>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: &str) -> DbResult<TransactionSlot> {
        self.transactions()
            .get(id)
            .cloned()
            .ok_or_else(|| self.no_transaction(id))
    }

    fn no_transaction(&self, id: &str) -> DbError {
        DbError::logic(format!("transaction '{id}' is not open on '{}'", self.id))
    }

    fn isolation_failed(&self, err: DbError) -> DbError {
        match err.kind() {
            ErrorKind::Connection | ErrorKind::Isolation => err,
            _ => DbError::isolation(&self.id, err.to_string()),
        }
    }

    /// Level an autocommit call has to switch its connection to, if any.
    fn requested(&self, isolation: Option<IsolationLevel>) -> Option<IsolationLevel> {
        isolation.filter(|level| *level != self.default_isolation)
    }

    /// Borrow a pooled connection for one autocommit call.
    async fn borrow(&self, isolation: Option<IsolationLevel>) -> DbResult<PinnedConnection> {
        let mut conn = PinnedConnection::acquire(&self.pool).await?;
        if let Some(level) = self.requested(isolation) {
            let sql = session_isolation_sql(self.db_type(), level);
            if let Err(e) = conn.statement(&sql, &[]).await {
                conn.discard();
                return Err(self.isolation_failed(e));
            }
        }
        Ok(conn)
    }

    /// Return a borrowed connection, resetting its isolation level first.
    async fn give_back(&self, mut conn: PinnedConnection, isolation: Option<IsolationLevel>) {
        if self.requested(isolation).is_none() {
            return;
        }
        let sql = session_isolation_sql(self.db_type(), self.default_isolation);
        if let Err(e) = conn.statement(&sql, &[]).await {
            warn!(
                connection = %self.id,
                error = %e,
                "Failed to reset isolation level, discarding connection"
            );
            conn.discard();
        }
    }

    /// Statement that switches an open transaction to `level`.
    fn transaction_isolation_sql(
        &self,
        open: &OpenTransaction,
        level: IsolationLevel,
    ) -> DbResult<String> {
        match self.db_type() {
            DatabaseType::SQLite => Ok(read_uncommitted_pragma(level)),
            DatabaseType::PostgreSQL if !open.used => Ok(format!(
                "SET TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            )),
            DatabaseType::PostgreSQL => Err(DbError::isolation(
                &self.id,
                "PostgreSQL fixes the isolation level once the transaction has run a statement",
            )),
            DatabaseType::MySQL => Err(DbError::isolation(
                &self.id,
                "MySQL fixes the isolation level when the transaction starts",
            )),
        }
    }
}

/// Statements that open a transaction at `level`.
fn begin_statements(db_type: DatabaseType, level: IsolationLevel) -> Vec<String> {
    match db_type {
        DatabaseType::PostgreSQL => vec![format!("BEGIN ISOLATION LEVEL {}", level.as_sql())],
        DatabaseType::MySQL => vec![
            format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
            "START TRANSACTION".to_string(),
        ],
        DatabaseType::SQLite => vec![read_uncommitted_pragma(level), "BEGIN".to_string()],
    }
}

/// Statement that sets the level of later transactions on one connection.
fn session_isolation_sql(db_type: DatabaseType, level: IsolationLevel) -> String {
    match db_type {
        DatabaseType::PostgreSQL => format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        ),
        DatabaseType::MySQL => format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
        DatabaseType::SQLite => read_uncommitted_pragma(level),
    }
}

// SQLite is always serializable; only dirty reads can be toggled.
fn read_uncommitted_pragma(level: IsolationLevel) -> String {
    format!(
        "PRAGMA read_uncommitted = {}",
        u8::from(level == IsolationLevel::ReadUncommitted)
    )
}

#[async_trait]
impl Adapter for SqlxAdapter {
    async fn query(
        &self,
        sql: &str,
        params: &[QueryParam],
        session: &Session,
    ) -> DbResult<ResultSet> {
        match session {
            Session::Transaction(id) => {
                let slot = self.slot(id)?;
                let mut guard = slot.lock().await;
                let open = guard.as_mut().ok_or_else(|| self.no_transaction(id))?;
                open.used = true;
                open.conn.query(sql, params).await
            }
            Session::Autocommit { isolation } => {
                let mut conn = self.borrow(*isolation).await?;
                let result = conn.query(sql, params).await;
                self.give_back(conn, *isolation).await;
                result
            }
        }
    }

    async fn statement(
        &self,
        sql: &str,
        params: &[QueryParam],
        session: &Session,
    ) -> DbResult<u64> {
        match session {
            Session::Transaction(id) => {
                let slot = self.slot(id)?;
                let mut guard = slot.lock().await;
                let open = guard.as_mut().ok_or_else(|| self.no_transaction(id))?;
                open.used = true;
                open.conn.statement(sql, params).await
            }
            Session::Autocommit { isolation } => {
                let mut conn = self.borrow(*isolation).await?;
                let result = conn.statement(sql, params).await;
                self.give_back(conn, *isolation).await;
                result
            }
        }
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn open_transactions(&self) -> Vec<String> {
        self.transactions().keys().cloned().collect()
    }

    async fn begin(&self, id: &str) -> DbResult<()> {
        if self.transactions().contains_key(id) {
            return Err(DbError::logic(format!(
                "transaction '{id}' is already open on '{}'",
                self.id
            )));
        }

        let mut conn = PinnedConnection::acquire(&self.pool).await?;
        conn.control(&begin_statements(self.db_type(), self.default_isolation))
            .await?;
        debug!(
            connection = %self.id,
            transaction_id = %id,
            isolation = %self.default_isolation,
            "Transaction begun"
        );
        self.transactions().insert(
            id.to_string(),
            Arc::new(Mutex::new(Some(OpenTransaction {
                conn,
                isolation: self.default_isolation,
                used: false,
            }))),
        );
        Ok(())
    }

    async fn commit(&self, id: &str) -> DbResult<()> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let open = guard.as_mut().ok_or_else(|| self.no_transaction(id))?;
        // On failure the connection stays pinned so the caller can roll back.
        open.conn.statement("COMMIT", &[]).await?;
        guard.take();
        self.transactions().remove(id);
        debug!(connection = %self.id, transaction_id = %id, "Transaction committed");
        Ok(())
    }

    async fn rollback(&self, id: &str) -> DbResult<()> {
        let slot = self
            .transactions()
            .remove(id)
            .ok_or_else(|| self.no_transaction(id))?;
        let mut guard = slot.lock().await;
        let mut open = guard.take().ok_or_else(|| self.no_transaction(id))?;
        if let Err(e) = open.conn.statement("ROLLBACK", &[]).await {
            warn!(
                connection = %self.id,
                transaction_id = %id,
                error = %e,
                "Rollback failed, discarding connection"
            );
            open.conn.discard();
            return Err(e);
        }
        debug!(connection = %self.id, transaction_id = %id, "Transaction rolled back");
        Ok(())
    }

    async fn isolation_level(&self, session: &Session) -> DbResult<IsolationLevel> {
        match session {
            Session::Autocommit { isolation } => Ok(isolation.unwrap_or(self.default_isolation)),
            Session::Transaction(id) => {
                let slot = self.slot(id)?;
                let guard = slot.lock().await;
                let open = guard.as_ref().ok_or_else(|| self.no_transaction(id))?;
                Ok(open.isolation)
            }
        }
    }

    async fn set_isolation_level(&self, session: &Session, level: IsolationLevel) -> DbResult<()> {
        let Session::Transaction(id) = session else {
            return Ok(());
        };
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let open = guard.as_mut().ok_or_else(|| self.no_transaction(id))?;
        if open.isolation == level {
            return Ok(());
        }
        let sql = self.transaction_isolation_sql(open, level)?;
        open.conn
            .statement(&sql, &[])
            .await
            .map_err(|e| self.isolation_failed(e))?;
        open.isolation = level;
        Ok(())
    }

    async fn close(&self) {
        let slots: Vec<(String, TransactionSlot)> = self.transactions().drain().collect();
        for (id, slot) in slots {
            if let Some(open) = slot.lock().await.take() {
                warn!(
                    connection = %self.id,
                    transaction_id = %id,
                    "Closing with an open transaction, discarding it"
                );
                open.conn.discard();
            }
        }
        self.pool.close().await;
    }
}

impl std::fmt::Debug for SqlxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxAdapter")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Build a result set from driver rows.
fn collect_rows<R: RowToJson>(rows: Vec<R>) -> ResultSet {
    let columns = rows.first().map(RowToJson::column_names).unwrap_or_default();
    let rows = rows.iter().map(RowToJson::to_json_row).collect();
    ResultSet::new(columns, rows)
}

// Without parameters the SQL runs unprepared, so statements that cannot be
// prepared (PRAGMA, SET TRANSACTION, DDL on MySQL) still work.

mod mysql {
    use super::*;
    use crate::db::params::mysql_query;
    use sqlx::MySqlConnection;

    pub async fn fetch(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ResultSet> {
        let rows = if params.is_empty() {
            use sqlx::Executor;
            conn.fetch_all(sql).await?
        } else {
            mysql_query(sql, params).fetch_all(&mut *conn).await?
        };
        Ok(collect_rows(rows))
    }

    pub async fn execute(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            conn.execute(sql).await?
        } else {
            mysql_query(sql, params).execute(&mut *conn).await?
        };
        Ok(result.rows_affected())
    }
}

mod postgres {
    use super::*;
    use crate::db::params::postgres_query;
    use sqlx::PgConnection;

    pub async fn fetch(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ResultSet> {
        let rows = if params.is_empty() {
            use sqlx::Executor;
            conn.fetch_all(sql).await?
        } else {
            postgres_query(sql, params).fetch_all(&mut *conn).await?
        };
        Ok(collect_rows(rows))
    }

    pub async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            conn.execute(sql).await?
        } else {
            postgres_query(sql, params).execute(&mut *conn).await?
        };
        Ok(result.rows_affected())
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::sqlite_query;
    use sqlx::SqliteConnection;

    pub async fn fetch(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ResultSet> {
        let rows = if params.is_empty() {
            use sqlx::Executor;
            conn.fetch_all(sql).await?
        } else {
            sqlite_query(sql, params).fetch_all(&mut *conn).await?
        };
        Ok(collect_rows(rows))
    }

    pub async fn execute(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            conn.execute(sql).await?
        } else {
            sqlite_query(sql, params).execute(&mut *conn).await?
        };
        Ok(result.rows_affected())
    }
}
