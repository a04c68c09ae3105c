//! Integration tests for read replica routing.

mod common;

use common::{Harness, connection_of};
use query_pipeline::middleware::ReplicaMiddleware;
use query_pipeline::models::{Fallback, Replica, Target, TransactionTarget};
use query_pipeline::{DbError, ErrorKind, Executor, Options, Pipeline};

fn harness() -> Harness {
    Harness::new(&["primary", "r1", "r2", "other"])
}

fn routed(h: &Harness, fallback: Fallback) -> Executor {
    let replicas = ReplicaMiddleware::new()
        .replicas("primary", ["r1", "r2"])
        .fallback(fallback);
    h.executor(Pipeline::new().query(replicas))
}

fn replica() -> Options {
    Options::new().with(Replica::new())
}

#[tokio::test]
async fn test_query_without_replica_configuration_uses_primary() {
    let h = harness();
    let executor = routed(&h, Fallback::Any);

    let result = executor.query("SELECT 1", Options::new()).await.unwrap();

    assert_eq!(connection_of(&result), "primary");
    assert_eq!(h.entries(), vec!["primary:query SELECT 1"]);
}

#[tokio::test]
async fn test_query_is_served_by_a_replica() {
    let h = harness();
    let executor = routed(&h, Fallback::None);

    for _ in 0..10 {
        let result = executor.query("SELECT 1", replica()).await.unwrap();
        let served_by = connection_of(&result);
        assert!(served_by == "r1" || served_by == "r2", "{served_by}");
    }
    assert_eq!(h.entries().len(), 10);
}

#[tokio::test]
async fn test_retryable_failure_falls_back_to_primary() {
    let h = harness();
    for name in ["r1", "r2"] {
        h.adapter(name)
            .fail_next_query(DbError::connection("replica down", "check replication"));
    }
    let executor = routed(&h, Fallback::Primary);

    let result = executor.query("SELECT 1", replica()).await.unwrap();

    assert_eq!(connection_of(&result), "primary");
    let entries = h.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries[0] == "r1:query SELECT 1" || entries[0] == "r2:query SELECT 1");
    assert_eq!(entries[1], "primary:query SELECT 1");
}

#[tokio::test]
async fn test_any_strategy_tries_every_replica_before_primary() {
    let h = harness();
    for name in ["r1", "r2"] {
        h.adapter(name).fail_next_query(DbError::deadlock("victim"));
    }
    let executor = routed(&h, Fallback::Any);

    let result = executor.query("SELECT 1", replica()).await.unwrap();

    assert_eq!(connection_of(&result), "primary");
    let mut entries = h.entries();
    assert_eq!(entries.pop().as_deref(), Some("primary:query SELECT 1"));
    entries.sort();
    assert_eq!(entries, vec!["r1:query SELECT 1", "r2:query SELECT 1"]);
}

#[tokio::test]
async fn test_non_retryable_failure_is_returned_immediately() {
    let h = harness();
    for name in ["r1", "r2"] {
        h.adapter(name)
            .fail_next_query(DbError::syntax("near \"SELEC\""));
    }
    let executor = routed(&h, Fallback::Any);

    let err = executor.query("SELECT 1", replica()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert_eq!(h.entries().len(), 1);
}

#[tokio::test]
async fn test_exhausted_candidates_return_first_failure() {
    let h = harness();
    h.adapter("r1")
        .fail_next_query(DbError::connection("r1 down", "check replication"));
    h.adapter("r2").fail_next_query(DbError::deadlock("r2 victim"));
    let executor = routed(&h, Fallback::Replicas);

    let err = executor.query("SELECT 1", replica()).await.unwrap_err();

    let entries = h.entries();
    assert_eq!(entries.len(), 2);
    if entries[0].starts_with("r1") {
        assert_eq!(err.kind(), ErrorKind::Connection);
    } else {
        assert_eq!(err.kind(), ErrorKind::Deadlock);
    }
}

#[tokio::test]
async fn test_per_call_retry_kinds() {
    let h = harness();
    for name in ["r1", "r2"] {
        h.adapter(name)
            .fail_next_query(DbError::driver("replica lagging", None));
    }
    let executor = routed(&h, Fallback::Primary);

    let result = executor
        .query(
            "SELECT 1",
            Options::new().with(Replica::new().retry_on([ErrorKind::Driver])),
        )
        .await
        .unwrap();
    assert_eq!(connection_of(&result), "primary");

    let h = harness();
    let executor = routed(&h, Fallback::Primary);
    for name in ["r1", "r2"] {
        h.adapter(name)
            .fail_next_query(DbError::connection("replica down", "check replication"));
    }
    let err = executor
        .query(
            "SELECT 1",
            Options::new().with(Replica::new().retry_on([ErrorKind::Driver])),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(h.entries().len(), 1);
}

#[tokio::test]
async fn test_per_call_fallback_overrides_default() {
    let h = harness();
    for name in ["r1", "r2"] {
        h.adapter(name)
            .fail_next_query(DbError::connection("replica down", "check replication"));
    }
    let executor = routed(&h, Fallback::Primary);

    let err = executor
        .query(
            "SELECT 1",
            Options::new().with(Replica::new().with_fallback(Fallback::None)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(h.entries().len(), 1);
}

#[tokio::test]
async fn test_disabled_middleware_uses_primary() {
    let h = harness();
    let replicas = ReplicaMiddleware::new().replicas("primary", ["r1", "r2"]);
    replicas.disable();
    let executor = h.executor(Pipeline::new().query(replicas));

    let result = executor.query("SELECT 1", replica()).await.unwrap();

    assert_eq!(connection_of(&result), "primary");
}

#[tokio::test]
async fn test_reads_inside_a_transaction_stay_on_primary() {
    let h = harness();
    let executor = routed(&h, Fallback::Replicas);

    let served_by = executor
        .transactional(
            Options::new().with(TransactionTarget::new(["primary"])),
            |tx| async move { tx.query("SELECT 1", replica()).await },
        )
        .await
        .unwrap();

    assert_eq!(connection_of(&served_by), "primary");
    assert_eq!(
        h.entries(),
        vec!["primary:begin", "primary:tx:query SELECT 1", "primary:commit"]
    );
}

#[tokio::test]
async fn test_connection_without_replicas_runs_on_itself() {
    let h = harness();
    let executor = routed(&h, Fallback::Replicas);

    let result = executor
        .query(
            "SELECT 1",
            replica().with(Target::new("other")),
        )
        .await
        .unwrap();

    assert_eq!(connection_of(&result), "other");
    assert_eq!(h.entries(), vec!["other:query SELECT 1"]);
}

#[tokio::test]
async fn test_replica_configuration_for_named_connection() {
    let h = harness();
    let executor = routed(&h, Fallback::None);

    let result = executor
        .query("SELECT 1", Options::new().with(Replica::of("primary")))
        .await
        .unwrap();
    assert_ne!(connection_of(&result), "primary");

    let err = executor
        .query(
            "SELECT 1",
            Options::new()
                .with(Replica::of("primary"))
                .with(Target::new("other")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_statements_are_never_routed() {
    let h = harness();
    let executor = routed(&h, Fallback::Replicas);

    let err = executor
        .statement("DELETE FROM t", replica())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(h.entries().is_empty());
}
