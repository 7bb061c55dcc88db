// ABOUTME: Integration tests for the mutation gateway's retry behavior
// ABOUTME: Uses paused tokio time so backoff delays are measured without waiting

use seafarm_store::row::row_from_value;
use seafarm_store::{
    row_id, MemoryStore, MemoryStoreOptions, Operation, RemoteStore, Row, StoreError,
};
use seafarm_sync::mutation::{IdStrategy, MutationError, MutationGateway, RetryPolicy};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn row(value: serde_json::Value) -> Row {
    row_from_value(value).unwrap()
}

fn gateway(memory: &Arc<MemoryStore>) -> MutationGateway {
    let store: Arc<dyn RemoteStore> = memory.clone();
    MutationGateway::new(store)
}

#[tokio::test(start_paused = true)]
async fn insert_gives_up_after_three_attempts() {
    let memory = Arc::new(MemoryStore::new());
    for n in 1..=3 {
        memory.fail_next(
            Operation::Insert,
            StoreError::Connectivity(format!("attempt {} refused", n)),
        );
    }
    let gateway = gateway(&memory);

    let started = Instant::now();
    let err = gateway
        .insert("sites", row(json!({"name": "X"})))
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_secs(6));
    assert_eq!(memory.attempts(Operation::Insert), 3);
    assert!(matches!(err, MutationError::Exhausted { attempts: 3, .. }));
    assert!(err.to_string().contains("attempt 3 refused"));
    assert_eq!(gateway.error(), Some(err));
    assert!(!gateway.loading());
    assert!(memory.rows("sites").is_empty());
}

#[tokio::test(start_paused = true)]
async fn insert_succeeds_on_third_attempt() {
    let memory = Arc::new(MemoryStore::new());
    memory.fail_next(Operation::Insert, StoreError::Connectivity("down".into()));
    memory.fail_next(Operation::Insert, StoreError::Connectivity("down".into()));
    let gateway = gateway(&memory).with_id_strategy(IdStrategy::Server);

    let started = Instant::now();
    let stored = gateway
        .insert("sites", row(json!({"name": "X"})))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(6));
    assert_eq!(stored, row(json!({"id": "sites-1", "name": "X"})));
    assert!(gateway.error().is_none());
}

#[tokio::test(start_paused = true)]
async fn client_ids_are_assigned_before_the_first_attempt() {
    let memory = Arc::new(MemoryStore::new());
    let gateway = gateway(&memory);

    let stored = gateway
        .insert("sites", row(json!({"name": "X"})))
        .await
        .unwrap();

    let id = row_id(&stored).unwrap();
    assert!(uuid::Uuid::parse_str(&id).is_ok());
    assert_eq!(memory.rows("sites"), vec![stored]);
}

#[tokio::test(start_paused = true)]
async fn timed_out_insert_that_committed_is_read_back() {
    let memory = Arc::new(MemoryStore::new());
    memory.fail_next_after_commit(Operation::Insert, StoreError::Timeout("30s".into()));
    let gateway = gateway(&memory);

    let stored = gateway
        .insert("sites", row(json!({"name": "Once"})))
        .await
        .unwrap();

    assert_eq!(stored["name"], json!("Once"));
    assert_eq!(memory.rows("sites").len(), 1);
    assert_eq!(memory.attempts(Operation::Insert), 2);
}

#[tokio::test(start_paused = true)]
async fn existing_id_after_refused_insert_is_a_conflict() {
    let memory = Arc::new(MemoryStore::new());
    memory.seed("sites", vec![row(json!({"id": "s1", "name": "Existing"}))]);
    memory.fail_next(Operation::Insert, StoreError::Connectivity("refused".into()));
    let gateway = gateway(&memory);

    let err = gateway
        .insert("sites", row(json!({"id": "s1", "name": "New"})))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MutationError::Rejected {
            source: StoreError::Conflict { .. },
            ..
        }
    ));
    assert_eq!(memory.attempts(Operation::Insert), 2);
    assert_eq!(
        memory.rows("sites"),
        vec![row(json!({"id": "s1", "name": "Existing"}))]
    );
}

#[tokio::test(start_paused = true)]
async fn server_id_insert_is_not_retried_when_outcome_is_unknown() {
    let memory = Arc::new(MemoryStore::new());
    memory.fail_next_after_commit(Operation::Insert, StoreError::Timeout("30s".into()));
    let gateway = gateway(&memory).with_id_strategy(IdStrategy::Server);

    let err = gateway
        .insert("sites", row(json!({"name": "Maybe"})))
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::Ambiguous { .. }));
    assert_eq!(memory.attempts(Operation::Insert), 1);
    assert_eq!(memory.rows("sites").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_write_is_not_retried() {
    let memory = Arc::new(MemoryStore::new());
    memory.fail_next(Operation::Insert, StoreError::Unauthorized("jwt expired".into()));
    let gateway = gateway(&memory);

    let started = Instant::now();
    let err = gateway
        .insert("sites", row(json!({"name": "X"})))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, MutationError::Rejected { .. }));
    assert_eq!(memory.attempts(Operation::Insert), 1);
}

#[tokio::test(start_paused = true)]
async fn update_of_missing_row_fails_without_retry() {
    let memory = Arc::new(MemoryStore::new());
    let gateway = gateway(&memory);

    let err = gateway
        .update("sites", "nope", row(json!({"name": "Y"})))
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(memory.attempts(Operation::Update), 1);
}

#[tokio::test(start_paused = true)]
async fn update_retries_transient_failures() {
    let memory = Arc::new(MemoryStore::new());
    memory.seed("modules", vec![row(json!({"id": "m1", "depth": 3}))]);
    memory.fail_next(
        Operation::Update,
        StoreError::Remote {
            status: 503,
            message: "unavailable".into(),
        },
    );
    let gateway = gateway(&memory);

    let started = Instant::now();
    let updated = gateway
        .update("modules", "m1", row(json!({"depth": 5})))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(updated, row(json!({"id": "m1", "depth": 5})));
}

#[tokio::test(start_paused = true)]
async fn deleting_missing_row_succeeds_when_store_allows_it() {
    let memory = Arc::new(MemoryStore::new());
    let gateway = gateway(&memory);

    gateway.remove("sites", "nonexistent").await.unwrap();
    assert!(gateway.error().is_none());
}

#[tokio::test(start_paused = true)]
async fn strict_store_reports_missing_row_on_delete() {
    let memory = Arc::new(MemoryStore::with_options(MemoryStoreOptions {
        strict_deletes: true,
    }));
    let gateway = gateway(&memory);

    let err = gateway.remove("sites", "nonexistent").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(memory.attempts(Operation::Delete), 1);
}

#[tokio::test(start_paused = true)]
async fn delete_that_timed_out_after_committing_succeeds_on_retry() {
    let memory = Arc::new(MemoryStore::with_options(MemoryStoreOptions {
        strict_deletes: true,
    }));
    memory.seed("sites", vec![row(json!({"id": "s1"}))]);
    memory.fail_next_after_commit(Operation::Delete, StoreError::Timeout("30s".into()));
    let gateway = gateway(&memory);

    gateway.remove("sites", "s1").await.unwrap();
    assert!(memory.rows("sites").is_empty());
    assert_eq!(memory.attempts(Operation::Delete), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_row_after_refused_delete_is_reported() {
    let memory = Arc::new(MemoryStore::with_options(MemoryStoreOptions {
        strict_deletes: true,
    }));
    memory.fail_next(Operation::Delete, StoreError::Connectivity("refused".into()));
    let gateway = gateway(&memory);

    let err = gateway.remove("sites", "nonexistent").await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(memory.attempts(Operation::Delete), 2);
    assert_eq!(gateway.error(), Some(err));
}

#[tokio::test(start_paused = true)]
async fn remove_many_deletes_every_id() {
    let memory = Arc::new(MemoryStore::new());
    memory.seed(
        "harvests",
        vec![
            row(json!({"id": "h1"})),
            row(json!({"id": "h2"})),
            row(json!({"id": "h3"})),
        ],
    );
    let gateway = gateway(&memory);

    let removed = gateway.remove_many("harvests", ["h1", "h3"]).await.unwrap();

    assert_eq!(removed, 2);
    assert_eq!(memory.rows("harvests"), vec![row(json!({"id": "h2"}))]);
}

#[tokio::test(start_paused = true)]
async fn invalid_table_is_rejected_before_any_attempt() {
    let memory = Arc::new(MemoryStore::new());
    let gateway = gateway(&memory);

    let err = gateway
        .insert("sites; drop", row(json!({"name": "X"})))
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::Invalid { .. }));
    assert_eq!(memory.attempts(Operation::Insert), 0);
}

#[tokio::test(start_paused = true)]
async fn loading_is_true_only_while_a_write_is_in_flight() {
    let memory = Arc::new(MemoryStore::new());
    memory.fail_next(Operation::Insert, StoreError::Connectivity("down".into()));
    let gateway = gateway(&memory).with_policy(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(500),
    });

    assert!(!gateway.loading());
    let pending = gateway.clone();
    let write = tokio::spawn(async move { pending.insert("sites", row(json!({"name": "X"}))).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.loading());

    write.await.unwrap().unwrap();
    assert!(!gateway.loading());
}
