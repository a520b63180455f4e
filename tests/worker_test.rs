use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use runworker::{
    task_fn, Assignment, AttemptStatus, ExecutionMode, InMemoryCheckpointStore, InMemoryRunEngine,
    RuntimeManager, TaskCatalog, TaskExecutor, Worker, WorkerConfig, WorkerProcess,
};

fn catalog() -> TaskCatalog {
    TaskCatalog::builder()
        .register(task_fn("send-email", |input, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({ "sent": true, "to": input["to"] }))
        }))
        .unwrap()
        .register(task_fn("approve", |_input, ctx| async move {
            let decision = ctx.wait_for_signal("approval").await?;
            Ok(json!({ "decision": decision }))
        }))
        .unwrap()
        .build()
}

fn worker(engine: Arc<InMemoryRunEngine>, mode: ExecutionMode) -> Worker {
    let executor = TaskExecutor::builder(catalog(), engine.clone())
        .mode(mode)
        .checkpoint_store(Arc::new(InMemoryCheckpointStore::new()))
        .build();
    Worker::builder(Arc::new(executor), engine)
        .poll_interval(Duration::from_millis(100))
        .heartbeat_interval(Duration::from_secs(1))
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_run_once_executes_one_assignment() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let worker = worker(engine.clone(), ExecutionMode::Dev);

    assert!(worker.run_once().await.unwrap().is_none());

    engine.enqueue(Assignment::new("run_1", "send-email", json!({ "to": "a@b.c" })));
    let dispatch = worker.run_once().await.unwrap().unwrap();
    assert_eq!(dispatch.process, WorkerProcess::Cold);
    assert_eq!(dispatch.report.status(), Some(AttemptStatus::Completed));
    assert!(worker.run_once().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_worker_drains_queue_until_shutdown() {
    let engine = Arc::new(InMemoryRunEngine::new());
    for i in 0..3 {
        engine.enqueue(Assignment::new(format!("run_{i}"), "send-email", json!({ "to": i })));
    }
    let worker = Arc::new(worker(engine.clone(), ExecutionMode::Dev));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown.cancel();
    handle.await.unwrap();

    for i in 0..3 {
        let last = engine.reports_for(&format!("run_{i}")).pop().unwrap();
        assert_eq!(last.status, AttemptStatus::Completed);
    }
    let heartbeats = engine.heartbeats();
    assert!(!heartbeats.is_empty());
    assert!(heartbeats.iter().all(|h| h.worker_id == worker.worker_id()));
}

#[tokio::test(start_paused = true)]
async fn test_suspended_run_resumes_from_stored_checkpoint() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let worker = worker(engine.clone(), ExecutionMode::Managed);

    engine.enqueue(Assignment::new("run_a", "approve", Value::Null));
    let first = worker.run_once().await.unwrap().unwrap();
    assert_eq!(first.report.status(), Some(AttemptStatus::Waiting));

    // The engine re-dispatches the run once the signal arrives, without the checkpoint.
    let mut resume = Assignment::new("run_a", "approve", Value::Null);
    resume.resume_with = Some(json!({ "approved": true }));
    engine.enqueue(resume);

    let second = worker.run_once().await.unwrap().unwrap();
    assert_eq!(second.report.status(), Some(AttemptStatus::Completed));
    let completed = engine.reports_for("run_a").pop().unwrap();
    assert_eq!(
        completed.output,
        Some(json!({ "decision": { "approved": true } }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_of_other_attempt_is_ignored() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let worker = worker(engine.clone(), ExecutionMode::Managed);

    engine.enqueue(Assignment::new("run_a", "approve", Value::Null));
    worker.run_once().await.unwrap();

    // A fresh attempt starts over and suspends on the same wait again.
    engine.enqueue(Assignment::new("run_a", "approve", Value::Null).with_attempt(2));
    let retried = worker.run_once().await.unwrap().unwrap();
    assert_eq!(retried.report.status(), Some(AttemptStatus::Waiting));
    assert_eq!(retried.report.attempt.attempt_number, 2);
}

#[tokio::test]
async fn test_from_config_wires_clients_and_options() {
    let envs: HashMap<String, String> = [
        ("RUNWORKER_EXECUTION_MODE", "managed"),
        ("RUNWORKER_ENGINE_URL", "http://127.0.0.1:9/engine"),
        ("RUNWORKER_WARM_START_URL", "http://127.0.0.1:9/warm"),
        ("RUNWORKER_WORKER_ID", "worker-7"),
        ("RUNWORKER_CAPTURE_CONSOLE", "off"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = WorkerConfig::from_env_map(&envs).unwrap();

    let worker = Worker::from_config(catalog(), &config).unwrap();
    assert_eq!(worker.worker_id(), "worker-7");
    assert!(worker.warm_start().is_some());
    assert_eq!(worker.executor().runtime().mode(), ExecutionMode::Managed);
    assert!(!worker.executor().options().capture_console);
    assert!(!worker.executor().console().captures_process_streams());

    let dev = Worker::from_config(catalog(), &WorkerConfig::default()).unwrap();
    assert!(dev.warm_start().is_none());
}
