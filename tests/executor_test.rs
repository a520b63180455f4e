use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use runworker::telemetry::{AttemptContextStack, InMemoryExporter, SpanStatus};
use runworker::{
    task_fn, Assignment, AttemptError, AttemptPhase, AttemptStatus, CheckpointStore, ExecutionMode,
    ExecutorOptions, InMemoryCheckpointStore, InMemoryRunEngine, ReportOutcome, RetryPolicy, Task,
    TaskCatalog, TaskConfig, TaskContext, TaskError, TaskExecutor, TelemetryPipeline,
};

fn executor(catalog: TaskCatalog, engine: Arc<InMemoryRunEngine>) -> TaskExecutor {
    TaskExecutor::builder(catalog, engine).build()
}

/// Process output of parallel tests would otherwise land in the exporter.
fn writers_only() -> ExecutorOptions {
    ExecutorOptions {
        capture_console: false,
        ..ExecutorOptions::default()
    }
}

fn send_email() -> TaskCatalog {
    TaskCatalog::builder()
        .register(task_fn("send-email", |input, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({ "sent": true, "to": input["to"] }))
        }))
        .unwrap()
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_send_email_completes() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let executor = executor(send_email(), engine.clone());

    let report = executor
        .execute(Assignment::new("run_1", "send-email", json!({ "to": "a@b.c" })))
        .await;

    assert_eq!(report.status(), Some(AttemptStatus::Completed));
    assert_eq!(report.attempt.phase, AttemptPhase::Reported);
    assert_eq!(report.delivery, ReportOutcome::Delivered);
    assert!(report.attempt.usage >= Duration::from_millis(50));

    let names: Vec<_> = report.timeline.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["started", "completed"]);
    assert!(report.timeline[0].elapsed_ms <= report.timeline[1].elapsed_ms);

    let reports = engine.reports_for("run_1");
    let statuses: Vec<_> = reports.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![AttemptStatus::Running, AttemptStatus::Completed]);
    assert_eq!(reports[1].output, Some(json!({ "sent": true, "to": "a@b.c" })));
    assert!(reports[1].usage_ms >= 50);
}

#[tokio::test(start_paused = true)]
async fn test_usage_timeout_fails_attempt() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let catalog = TaskCatalog::builder()
        .register(
            task_fn("slow", |_input, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Null)
            })
            .with_config(
                TaskConfig::default()
                    .with_max_duration(Duration::from_millis(100))
                    .with_retry(RetryPolicy::fixed(3, Duration::from_secs(1))),
            ),
        )
        .unwrap()
        .build();
    let executor = executor(catalog, engine.clone());

    let report = executor.execute(Assignment::new("run_t", "slow", Value::Null)).await;

    assert_eq!(report.status(), Some(AttemptStatus::Failed));
    match report.error() {
        Some(AttemptError::UsageTimeoutExceeded { limit_ms, used_ms }) => {
            assert_eq!(*limit_ms, 100);
            assert!(*used_ms >= 100 && *used_ms < 1_000);
        }
        other => panic!("expected usage timeout, got {other:?}"),
    }
    assert!(report.attempt.usage < Duration::from_secs(1));

    let failed = engine.reports_for("run_t").pop().unwrap();
    let error = failed.error.unwrap();
    assert_eq!(error.code, "USAGE_TIMEOUT_EXCEEDED");
    assert!(error.retryable);
    assert_eq!(error.retry_delay_ms, Some(1_000));
}

#[tokio::test(start_paused = true)]
async fn test_default_max_duration_applies() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let catalog = TaskCatalog::builder()
        .register(task_fn("slow", |_input, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }))
        .unwrap()
        .build();
    let executor = TaskExecutor::builder(catalog, engine.clone())
        .options(ExecutorOptions {
            default_max_duration: Some(Duration::from_millis(200)),
            ..ExecutorOptions::default()
        })
        .build();

    let report = executor.execute(Assignment::new("run_d", "slow", Value::Null)).await;
    assert!(matches!(
        report.error(),
        Some(AttemptError::UsageTimeoutExceeded { limit_ms: 200, .. })
    ));
    // No retry policy on the task: the engine is told not to retry.
    let error = engine.reports_for("run_d").pop().unwrap().error.unwrap();
    assert!(!error.retryable);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_task_fails_without_usage() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let executor = executor(send_email(), engine.clone());

    let report = executor.execute(Assignment::new("run_g", "ghost", json!({}))).await;

    assert_eq!(
        report.error(),
        Some(&AttemptError::UnknownTask { task_id: "ghost".into() })
    );
    assert_eq!(report.attempt.usage, Duration::ZERO);
    assert!(report.timeline.is_empty());
    assert_eq!(
        report.attempt.history,
        vec![
            AttemptPhase::Idle,
            AttemptPhase::Initializing,
            AttemptPhase::Failed,
            AttemptPhase::Reported
        ]
    );

    let reports = engine.reports_for("run_g");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, AttemptStatus::Failed);
    assert_eq!(reports[0].usage_ms, 0);
    let error = reports[0].error.as_ref().unwrap();
    assert_eq!(error.code, "UNKNOWN_TASK");
    assert!(!error.retryable);
}

#[tokio::test(start_paused = true)]
async fn test_managed_wait_suspends_and_resumes() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let catalog = TaskCatalog::builder()
        .register(task_fn("digest", |_input, ctx| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.save_state(json!({ "collected": 3 }));
            ctx.metadata().set("phase", "waiting");
            ctx.wait_for(Duration::from_secs(3600)).await?;
            Ok(json!({ "state": ctx.state() }))
        }))
        .unwrap()
        .build();
    let executor = TaskExecutor::builder(catalog, engine.clone())
        .mode(ExecutionMode::Managed)
        .checkpoint_store(store.clone())
        .build();

    let suspended = executor.execute(Assignment::new("run_w", "digest", json!({}))).await;
    assert_eq!(suspended.status(), Some(AttemptStatus::Waiting));
    assert_eq!(suspended.attempt.phase, AttemptPhase::Reported);
    assert!(suspended.attempt.history.contains(&AttemptPhase::Suspended));
    assert!(suspended.timeline.iter().any(|m| m.name == "suspended"));

    let waiting = engine.reports_for("run_w").pop().unwrap();
    assert_eq!(waiting.status, AttemptStatus::Waiting);
    let checkpoint = waiting.checkpoint.expect("waiting report carries the checkpoint");
    assert_eq!(checkpoint.pending_wait.as_ref().map(|p| p.index), Some(0));
    assert_eq!(checkpoint.task_state, Some(json!({ "collected": 3 })));
    assert_eq!(checkpoint.metadata.get("phase"), Some(&json!("waiting")));
    let usage_before = checkpoint.usage_ms;
    assert!(usage_before >= 20);

    let stored = store.load("run_w").await.unwrap().unwrap();
    assert_eq!(stored, checkpoint);

    // An hour passes; none of it is usage.
    tokio::time::advance(Duration::from_secs(3600)).await;

    let resumed = executor
        .resume(Assignment::new("run_w", "digest", json!({})), stored)
        .await;
    assert_eq!(resumed.status(), Some(AttemptStatus::Completed));
    assert!(resumed.attempt.usage < Duration::from_secs(1));
    assert!(resumed.attempt.usage.as_millis() as u64 >= usage_before);

    let names: Vec<_> = resumed.timeline.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["started", "suspended", "resumed", "completed"]);

    let completed = engine.reports_for("run_w").pop().unwrap();
    assert_eq!(completed.status, AttemptStatus::Completed);
    assert_eq!(completed.output, Some(json!({ "state": { "collected": 3 } })));
    assert!(store.load("run_w").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dev_wait_blocks_in_process_without_usage() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let catalog = TaskCatalog::builder()
        .register(task_fn("nap", |_input, ctx| async move {
            ctx.wait_for(Duration::from_secs(60)).await?;
            Ok(json!(ctx.usage().as_millis() as u64))
        }))
        .unwrap()
        .build();
    let executor = executor(catalog, engine.clone());

    let report = executor.execute(Assignment::new("run_n", "nap", Value::Null)).await;
    assert_eq!(report.status(), Some(AttemptStatus::Completed));
    assert!(report.attempt.usage < Duration::from_secs(1));
    assert!(!report.attempt.history.contains(&AttemptPhase::Suspended));
}

#[tokio::test(start_paused = true)]
async fn test_sequential_attempts_keep_console_output_apart() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let exporter = Arc::new(InMemoryExporter::new());
    let pipeline = TelemetryPipeline::new(exporter.clone(), AttemptContextStack::new());
    let catalog = TaskCatalog::builder()
        .register(task_fn("echo", |input, ctx| async move {
            let mut out = ctx.console().stdout();
            writeln!(out, "processing {}", input["n"]).map_err(anyhow::Error::from)?;
            Ok(input)
        }))
        .unwrap()
        .build();
    let executor = TaskExecutor::builder(catalog, engine.clone())
        .telemetry(pipeline.clone())
        .options(writers_only())
        .build();

    executor.execute(Assignment::new("run_a", "echo", json!({ "n": 1 }))).await;
    executor.execute(Assignment::new("run_b", "echo", json!({ "n": 2 }))).await;

    let logs = exporter.logs();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].message, "processing 1");
    assert_eq!(logs[0].attributes.get("run.id"), Some(&json!("run_a")));
    assert_eq!(logs[1].message, "processing 2");
    assert_eq!(logs[1].attributes.get("run.id"), Some(&json!("run_b")));

    assert!(!executor.console().is_active());
    assert_eq!(pipeline.context_stack().depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_span_and_task_logs_are_tagged() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let exporter = Arc::new(InMemoryExporter::new());
    let pipeline = TelemetryPipeline::new(exporter.clone(), AttemptContextStack::new());
    let catalog = TaskCatalog::builder()
        .register(task_fn("noisy", |_input, ctx| async move {
            ctx.logger().debug("dropped at info level");
            ctx.logger().warn("about to fail");
            Err(TaskError::permanent(anyhow::anyhow!("mailbox full")))
        }))
        .unwrap()
        .build();
    let executor = TaskExecutor::builder(catalog, engine.clone())
        .telemetry(pipeline)
        .options(writers_only())
        .build();

    let report = executor.execute(Assignment::new("run_s", "noisy", Value::Null)).await;
    assert_eq!(
        report.error(),
        Some(&AttemptError::Handler { message: "mailbox full".into(), retryable: false })
    );

    let logs = exporter.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "about to fail");
    assert_eq!(logs[0].attributes.get("task.id"), Some(&json!("noisy")));

    let spans = exporter.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "attempt");
    assert_eq!(spans[0].attributes.get("run.id"), Some(&json!("run_s")));
    assert!(matches!(spans[0].status, SpanStatus::Error(_)));
    assert!(spans[0].events.iter().any(|e| e.name == "exception"));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_is_reported() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let catalog = TaskCatalog::builder()
        .register(task_fn("boom", |_input, _ctx| async move {
            if true {
                panic!("exploded");
            }
            Ok(Value::Null)
        }))
        .unwrap()
        .build();
    let executor = executor(catalog, engine.clone());

    let report = executor.execute(Assignment::new("run_p", "boom", Value::Null)).await;
    assert_eq!(
        report.error(),
        Some(&AttemptError::Panicked { message: "exploded".into() })
    );
    assert_eq!(engine.reports_for("run_p").pop().unwrap().error.unwrap().code, "PANICKED");
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_execution_reports_terminal_status_once() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let catalog = TaskCatalog::builder()
        .register(task_fn("send-email", {
            let runs = runs.clone();
            move |input: Value, _ctx| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "sent": true, "to": input["to"] }))
                }
            }
        }))
        .unwrap()
        .build();
    let executor = executor(catalog, engine.clone());
    let assignment = Assignment::new("run_1", "send-email", json!({ "to": "a@b.c" }));

    let first = executor.execute(assignment.clone()).await;
    let second = executor.execute(assignment).await;

    assert_eq!(first.delivery, ReportOutcome::Delivered);
    assert_eq!(second.delivery, ReportOutcome::Duplicate);
    assert_eq!(second.status(), Some(AttemptStatus::Completed));
    assert_eq!(second.attempt.outcome, first.attempt.outcome);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let statuses: Vec<_> = engine.reports_for("run_1").iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![AttemptStatus::Running, AttemptStatus::Completed]);

    // A new attempt of the same run is executed.
    let retry = executor
        .execute(Assignment::new("run_1", "send-email", json!({ "to": "a@b.c" })).with_attempt(2))
        .await;
    assert_eq!(retry.delivery, ReportOutcome::Delivered);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_deferred_running_report_never_follows_completion() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let executor = executor(send_email(), engine.clone());

    // Enough failures to exhaust the running report's retries.
    engine.fail_next_reports(5);
    let report = executor
        .execute(Assignment::new("run_o", "send-email", json!({ "to": "x" })))
        .await;
    assert_eq!(report.delivery, ReportOutcome::Delivered);
    assert!(executor.reporter().pending().is_empty());

    assert_eq!(executor.reporter().retry_pending().await, 0);
    let statuses: Vec<_> = engine.reports_for("run_o").iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![AttemptStatus::Completed]);
}

#[tokio::test(start_paused = true)]
async fn test_dev_signal_reaches_only_its_run() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let catalog = TaskCatalog::builder()
        .register(task_fn("approve", |_input, ctx| async move {
            let decision = ctx.wait_for_signal("approval").await?;
            Ok(json!({ "decision": decision }))
        }))
        .unwrap()
        .build();
    let executor = Arc::new(executor(catalog, engine.clone()));

    executor
        .runtime()
        .complete_signal("run_A", "approval", json!({ "for": "run_A" }));

    let running = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(Assignment::new("run_B", "approve", Value::Null)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!running.is_finished());

    executor
        .runtime()
        .complete_signal("run_B", "approval", json!({ "for": "run_B" }));
    let report = running.await.unwrap();

    assert_eq!(report.status(), Some(AttemptStatus::Completed));
    assert_eq!(
        engine.reports_for("run_B").pop().unwrap().output,
        Some(json!({ "decision": { "for": "run_B" } }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_report_retries_transient_failures() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let executor = executor(send_email(), engine.clone());

    // Running report absorbs both failures, the terminal one goes straight through.
    engine.fail_next_reports(2);
    let report = executor
        .execute(Assignment::new("run_r", "send-email", json!({ "to": "x" })))
        .await;

    assert_eq!(report.delivery, ReportOutcome::Delivered);
    assert_eq!(engine.reports_for("run_r").len(), 2);
    assert!(executor.reporter().pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_background_work_finishes_before_completion() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let catalog = TaskCatalog::builder()
        .register(task_fn("fire-and-forget", |_input, ctx| async move {
            let metadata = ctx.metadata().clone();
            ctx.wait_barrier().spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                metadata.set("delivered", true);
            });
            Ok(Value::Null)
        }))
        .unwrap()
        .build();
    let executor = executor(catalog, engine.clone());

    let report = executor
        .execute(Assignment::new("run_b", "fire-and-forget", Value::Null))
        .await;

    assert_eq!(report.status(), Some(AttemptStatus::Completed));
    let metadata = engine.metadata("run_b").unwrap();
    assert_eq!(metadata.get("delivered"), Some(&json!(true)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_current_interrupts_attempt() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let catalog = TaskCatalog::builder()
        .register(task_fn("forever", |_input, ctx| async move {
            while !ctx.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            ctx.check_cancelled()?;
            Ok(Value::Null)
        }))
        .unwrap()
        .build();
    let executor = Arc::new(executor(catalog, engine.clone()));

    let running = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(Assignment::new("run_c", "forever", Value::Null)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(executor.cancel_current("operator request"));

    let report = running.await.unwrap();
    assert_eq!(
        report.error(),
        Some(&AttemptError::Cancelled { reason: "operator request".into() })
    );
    assert!(!executor.cancel_current("nothing running"));
}

struct Greet;

#[derive(serde::Deserialize)]
struct GreetInput {
    name: String,
}

#[async_trait::async_trait]
impl Task for Greet {
    type Input = GreetInput;
    type Output = String;

    fn id(&self) -> &str {
        "greet"
    }

    async fn run(&self, input: GreetInput, _ctx: &TaskContext) -> Result<String, TaskError> {
        Ok(format!("hello {}", input.name))
    }
}

#[tokio::test(start_paused = true)]
async fn test_typed_task_input_validation() {
    let engine = Arc::new(InMemoryRunEngine::new());
    let catalog = TaskCatalog::builder().register(Greet).unwrap().build();
    let executor = executor(catalog, engine.clone());

    let ok = executor
        .execute(Assignment::new("run_ok", "greet", json!({ "name": "ada" })))
        .await;
    assert_eq!(
        engine.reports_for("run_ok").pop().unwrap().output,
        Some(json!("hello ada"))
    );
    assert_eq!(ok.status(), Some(AttemptStatus::Completed));

    let bad = executor
        .execute(Assignment::new("run_bad", "greet", json!({ "nom": "ada" })))
        .await;
    assert!(matches!(bad.error(), Some(AttemptError::InvalidInput { .. })));
}
