//! Integration tests against a real SQLite database.
//!
//! Tests verify that:
//! - Statements and parameterized queries run through the sqlx adapter
//! - Logical transactions commit and roll back on a pinned connection
//! - Two SQLite files can take part in one logical transaction
//! - Independent transactions on one connection each pin their own connection
//! - Isolation levels reach the connection that runs the SQL

use query_pipeline::config::PoolOptions;
use query_pipeline::middleware::IsolationMiddleware;
use query_pipeline::models::{
    ConnectionConfig, Isolation, IsolationLevel, Query, Target, TransactionTarget,
};
use query_pipeline::{
    Adapter, AdapterRegistry, DbError, ErrorKind, Executor, Options, Pipeline, SqlxAdapter,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Create a writable SQLite database file and return its connection string.
fn temp_database() -> String {
    let temp_file = NamedTempFile::new().unwrap();
    // Keep the temp file alive - prevent deletion when function returns
    let db_path = temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    format!("sqlite:{db_path}")
}

async fn connect(id: &str) -> Arc<SqlxAdapter> {
    let pool_options = PoolOptions {
        max_connections: Some(4),
        ..PoolOptions::default()
    };
    let config = ConnectionConfig::new(id, temp_database(), true, pool_options).unwrap();
    Arc::new(SqlxAdapter::connect(&config).await.unwrap())
}

async fn setup(names: &[&str]) -> Executor {
    let mut registry = AdapterRegistry::new(names[0]);
    for name in names {
        registry.register(*name, connect(name).await).unwrap();
    }
    let registry = Arc::new(registry);
    let pipeline = Pipeline::new().layer(IsolationMiddleware::new(Arc::clone(&registry)));
    let executor = Executor::new(registry, pipeline);

    for name in names {
        executor
            .statement(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER)",
                Options::new().with(Target::new(*name)),
            )
            .await
            .unwrap();
    }
    executor
}

fn as_i64(value: Option<&JsonValue>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

async fn count(executor: &Executor, connection: &str) -> i64 {
    let result = executor
        .query(
            "SELECT COUNT(*) AS n FROM users",
            Options::new().with(Target::new(connection)),
        )
        .await
        .unwrap();
    as_i64(result.scalar("n")).unwrap()
}

fn insert(name: &str, age: i64) -> Query {
    Query::new("INSERT INTO users (name, age) VALUES (?, ?)")
        .bind(name)
        .bind(age)
}

#[tokio::test]
async fn test_parameterized_insert_and_select() {
    let executor = setup(&["app"]).await;

    let affected = executor
        .statement(insert("alice", 30), Options::new())
        .await
        .unwrap();
    assert_eq!(affected, 1);
    executor
        .statement(insert("bob", 25), Options::new())
        .await
        .unwrap();

    let result = executor
        .query(
            Query::new("SELECT name, age FROM users WHERE age > ? ORDER BY name").bind(20i64),
            Options::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.columns(), ["name", "age"]);
    assert_eq!(result.len(), 2);
    assert_eq!(result.rows()[0]["name"], "alice");
    assert_eq!(as_i64(result.rows()[0].get("age")), Some(30));
    assert_eq!(result.rows()[1]["name"], "bob");
}

#[tokio::test]
async fn test_invalid_sql_is_reported() {
    let executor = setup(&["app"]).await;

    let err = executor
        .query("SELECT * FROM missing_table", Options::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err.kind(),
        ErrorKind::Driver | ErrorKind::Syntax | ErrorKind::NotExists
    ));
}

#[tokio::test]
async fn test_transaction_commit_persists_rows() {
    let executor = setup(&["app"]).await;

    executor
        .transactional(Options::new(), |tx| async move {
            tx.statement(insert("alice", 30), Options::new()).await?;
            tx.statement(insert("bob", 25), Options::new()).await?;
            let inside = tx.query("SELECT COUNT(*) AS n FROM users", Options::new()).await?;
            assert_eq!(as_i64(inside.scalar("n")), Some(2));
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(count(&executor, "app").await, 2);
}

#[tokio::test]
async fn test_transaction_failure_discards_rows() {
    let executor = setup(&["app"]).await;

    let err = executor
        .transactional(Options::new(), |tx| async move {
            tx.statement(insert("alice", 30), Options::new()).await?;
            Err::<(), _>(DbError::logic("abort"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RollbackTransaction);
    assert_eq!(count(&executor, "app").await, 0);
}

#[tokio::test]
async fn test_transaction_across_two_files() {
    let executor = setup(&["orders", "audit"]).await;
    let both = || Options::new().with(TransactionTarget::new(["orders", "audit"]));

    executor
        .transactional(both(), |tx| async move {
            tx.statement(insert("alice", 30), Options::new().with(Target::new("orders")))
                .await?;
            tx.statement(insert("alice", 30), Options::new().with(Target::new("audit")))
                .await
        })
        .await
        .unwrap();
    assert_eq!(count(&executor, "orders").await, 1);
    assert_eq!(count(&executor, "audit").await, 1);

    let err = executor
        .transactional(both(), |tx| async move {
            tx.statement(insert("bob", 25), Options::new().with(Target::new("orders")))
                .await?;
            tx.statement("INSERT INTO nowhere VALUES (1)", Options::new().with(Target::new("audit")))
                .await
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RollbackTransaction);
    assert_eq!(count(&executor, "orders").await, 1);
    assert_eq!(count(&executor, "audit").await, 1);
}

async fn read_uncommitted(executor: &Executor, options: Options) -> Option<i64> {
    let result = executor.query("PRAGMA read_uncommitted", options).await.unwrap();
    as_i64(result.scalar("read_uncommitted"))
}

fn dirty_reads() -> Options {
    Options::new().with(Isolation::new(IsolationLevel::ReadUncommitted))
}

#[tokio::test]
async fn test_isolation_level_reaches_the_driver() {
    let executor = setup(&["app"]).await;

    assert_eq!(read_uncommitted(&executor, dirty_reads()).await, Some(1));
    assert_eq!(read_uncommitted(&executor, Options::new()).await, Some(0));
}

#[tokio::test]
async fn test_isolation_level_inside_a_transaction() {
    let executor = setup(&["app"]).await;

    executor
        .transactional(Options::new(), |tx| async move {
            assert_eq!(read_uncommitted(&tx, dirty_reads()).await, Some(1));
            assert_eq!(read_uncommitted(&tx, Options::new()).await, Some(0));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_transactions_on_one_connection() {
    let executor = setup(&["app"]).await;

    let (writer, reader) = tokio::join!(
        executor.transactional(Options::new(), |tx| async move {
            tx.statement(insert("alice", 30), Options::new()).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            executor
                .transactional(Options::new(), |tx| async move {
                    let result = tx
                        .query("SELECT COUNT(*) AS n FROM users", Options::new())
                        .await?;
                    Ok(as_i64(result.scalar("n")))
                })
                .await
        }
    );

    writer.unwrap();
    assert_eq!(reader.unwrap(), Some(0));
    assert_eq!(count(&executor, "app").await, 1);
}

#[tokio::test]
async fn test_cancelled_transaction_releases_connection() {
    let executor = setup(&["app"]).await;

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        executor.transactional(Options::new(), |tx| async move {
            tx.statement(insert("alice", 30), Options::new()).await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let adapter = executor.registry().adapter("app").unwrap();
    assert!(!adapter.in_transaction().await);
    assert_eq!(count(&executor, "app").await, 0);

    executor
        .transactional(Options::new(), |tx| async move {
            tx.statement(insert("bob", 25), Options::new()).await
        })
        .await
        .unwrap();
    assert_eq!(count(&executor, "app").await, 1);
}

#[tokio::test]
async fn test_close_releases_pool() {
    let adapter = connect("app").await;
    assert!(!adapter.in_transaction().await);
    adapter.begin("tx_manual").await.unwrap();
    assert_eq!(adapter.open_transactions().await, vec!["tx_manual"]);
    adapter.close().await;
    assert!(!adapter.in_transaction().await);
}
