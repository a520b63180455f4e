//! Integration tests for the SQLite checkpoint store.

#![cfg(feature = "sqlite")]

use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;

use runworker::{
    task_fn, Assignment, AttemptStatus, CheckpointStore, ExecutionMode, InMemoryRunEngine,
    SqliteCheckpointStore, TaskCatalog, TaskExecutor,
};

async fn store() -> SqliteCheckpointStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteCheckpointStore::new(pool);
    store.run_migrations().await.unwrap();
    store
}

#[tokio::test]
async fn test_suspended_attempt_survives_executor_restart() {
    let store = Arc::new(store().await);
    let catalog = TaskCatalog::builder()
        .register(task_fn("report", |_input, ctx| async move {
            ctx.save_state(json!({ "rows": 120 }));
            ctx.wait_for(Duration::from_secs(600)).await?;
            Ok(json!({ "state": ctx.state() }))
        }))
        .unwrap()
        .build();

    let engine = Arc::new(InMemoryRunEngine::new());
    let first = TaskExecutor::builder(catalog.clone(), engine.clone())
        .mode(ExecutionMode::Managed)
        .checkpoint_store(store.clone())
        .build();
    let suspended = first.execute(Assignment::new("run_s", "report", Value::Null)).await;
    assert_eq!(suspended.status(), Some(AttemptStatus::Waiting));
    drop(first);

    let state = store.load("run_s").await.unwrap().unwrap();
    assert_eq!(state.task_state, Some(json!({ "rows": 120 })));

    let second = TaskExecutor::builder(catalog, engine.clone())
        .mode(ExecutionMode::Managed)
        .checkpoint_store(store.clone())
        .build();
    let resumed = second
        .resume(Assignment::new("run_s", "report", Value::Null), state)
        .await;

    assert_eq!(resumed.status(), Some(AttemptStatus::Completed));
    assert!(store.load("run_s").await.unwrap().is_none());
}
