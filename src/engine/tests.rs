use chrono::Duration;
use maplit::hashset;
use serde_json::{json, Map};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::scheduler::{Scheduler, SchedulerSettings};
use super::state::{self, Invocation, TASK_TIMEOUT_EXCEEDED};
use super::*;
use crate::clock::TokioClock;
use crate::lock::{DistributedLock, InMemoryLockStore, LockStore};
use crate::repository::InMemoryExecutionRepository;
use crate::test_helpers::{epoch, fast_settings, Cluster};
use crate::types::{ExecutionType, Stage, Task};

fn secs(n: u64) -> StdDuration {
    StdDuration::from_secs(n)
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("ok", |_| async { Ok::<_, anyhow::Error>(TaskResult::succeeded()) })
        .register_fn("fail", |_| async {
            Ok::<_, anyhow::Error>(TaskResult::terminal("boom"))
        })
        .register_fn("wait", |_| async { Ok::<_, anyhow::Error>(TaskResult::running()) })
        .register_fn("echo", |ctx: TaskContext| async move {
            let input = ctx.stage_context.get("input").cloned().unwrap_or_default();
            Ok::<_, anyhow::Error>(TaskResult::succeeded().with_output("seen", input))
        });
    registry
}

fn counting(registry: &mut TaskRegistry, id: &str, result: TaskResult) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    registry.register_fn(id, move |_| {
        let counter = counter.clone();
        let result = result.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(result)
        }
    });
    calls
}

fn task(id: &str, implementation: &str) -> Task {
    Task::new(id, implementation, secs(1), secs(60))
}

/// s1 -> s2, one task each
fn linear(partition: &str, first: &str, second: &str) -> Execution {
    Execution::new(ExecutionType::Pipeline, "app", partition)
        .with_id("e1")
        .with_stage(
            Stage::new("s1", "deploy")
                .with_task(task("t1", first))
                .with_child("s2"),
        )
        .with_stage(Stage::new("s2", "verify").with_task(task("t2", second)))
}

#[tokio::test]
async fn test_linear_pipeline_takes_one_lock_per_batch() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "ok", "ok")).await;
    let mut node = cluster.node(Some("a")).await;

    let outcome = node.engine.start("e1").await.unwrap();
    assert!(matches!(outcome, ControlOutcome::Applied(ref runs) if runs.len() == 1));
    assert_eq!(node.run_until_idle(10).await, 2);

    let execution = cluster.load("e1").await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert!(execution
        .stages
        .iter()
        .all(|s| s.status == ExecutionStatus::Succeeded));
    assert_eq!(execution.end_time, Some(epoch()));
    // start, t1 result, t2 result
    assert_eq!(cluster.locks.acquisitions(), 3);
}

#[tokio::test]
async fn test_fan_out_and_join() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(
            Stage::new("s1", "bake")
                .with_task(task("t", "ok"))
                .with_child("s2")
                .with_child("s3"),
        )
        .with_stage(Stage::new("s2", "deploy").with_task(task("t", "ok")).with_child("s4"))
        .with_stage(Stage::new("s3", "deploy").with_task(task("t", "wait")).with_child("s4"))
        .with_stage(Stage::new("s4", "notify").with_task(task("t", "ok")));
    cluster.seed(&execution).await;
    let mut node = cluster.node(None).await;

    node.engine.start("e1").await.unwrap();
    node.step().await;

    let started: HashSet<String> = node.pending().into_iter().map(|r| r.stage_id).collect();
    assert_eq!(started, hashset! {"s2".to_string(), "s3".to_string()});

    node.run_until_idle(3).await;
    let execution = cluster.load("e1").await;
    assert_eq!(execution.stage("s2").unwrap().status, ExecutionStatus::Succeeded);
    assert_eq!(execution.stage("s3").unwrap().status, ExecutionStatus::Running);
    // join waits for both parents
    assert_eq!(execution.stage("s4").unwrap().status, ExecutionStatus::NotStarted);
}

#[tokio::test]
async fn test_task_outputs_reach_stage_context() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Orchestration, "app", "a")
        .with_id("e1")
        .with_stage(
            Stage::new("s1", "echo")
                .with_context("input", json!("hello"))
                .with_task(task("t1", "echo")),
        );
    cluster.seed(&execution).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.run_until_idle(5).await;

    let execution = cluster.load("e1").await;
    assert_eq!(execution.stages[0].context.get("seen"), Some(&json!("hello")));
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn test_tasks_in_a_stage_run_in_order() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(
            Stage::new("s1", "deploy")
                .with_task(task("first", "ok"))
                .with_task(task("second", "ok")),
        );
    cluster.seed(&execution).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.run_until_idle(5).await;

    let order: Vec<&str> = node.invoked.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(order, vec!["first", "second"]);
    assert_eq!(cluster.load("e1").await.status, ExecutionStatus::Succeeded);
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn between(&mut self, low: u64, high: u64) -> u64 {
        low + self.next() % (high - low + 1)
    }
}

#[tokio::test]
async fn test_running_task_times_out_on_first_invocation_past_its_timeout() {
    let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);

    for case in 0..25 {
        let backoff_ms = rng.between(100, 3_000);
        let timeout_ms = rng.between(0, 10_000);

        let mut registry = TaskRegistry::new();
        let calls = counting(&mut registry, "poll", TaskResult::running());
        let cluster = Cluster::new(registry);
        let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
            .with_id("e1")
            .with_stage(Stage::new("s1", "wait").with_task(Task::new(
                "t1",
                "poll",
                StdDuration::from_millis(backoff_ms),
                StdDuration::from_millis(timeout_ms),
            )));
        cluster.seed(&execution).await;
        let mut node = cluster.node(Some("a")).await;

        node.engine.start("e1").await.unwrap();
        node.run_until_idle(500).await;

        let execution = cluster.load("e1").await;
        let task = execution.stages[0].task("t1").unwrap();
        let started = task.started_at.unwrap();
        let timeout = Duration::milliseconds(timeout_ms as i64);
        let times: Vec<_> = node.invoked.iter().map(|r| r.not_before).collect();

        assert_eq!(task.status, TaskStatus::Terminal, "case {}", case);
        assert_eq!(execution.status, ExecutionStatus::Terminal, "case {}", case);
        assert!(task.error.as_deref().unwrap().starts_with(TASK_TIMEOUT_EXCEEDED));

        let (last, earlier) = times.split_last().unwrap();
        assert!(*last - started > timeout, "case {}", case);
        assert!(earlier.iter().all(|t| *t - started <= timeout), "case {}", case);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::milliseconds(backoff_ms as i64));
        }
        // the timed-out invocation never reaches the handler
        assert_eq!(calls.load(Ordering::SeqCst) as usize, times.len() - 1);
    }
}

#[tokio::test]
async fn test_cancel_stops_pending_work() {
    let mut registry = TaskRegistry::new();
    let calls = counting(&mut registry, "poll", TaskResult::running());
    let cluster = Cluster::new(registry);
    cluster.seed(&linear("a", "poll", "poll")).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.step().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let outcome = node
        .engine
        .cancel("e1", Some("ops".to_string()), Some("bad build".to_string()))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Applied(Vec::new()));

    node.run_until_idle(10).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let execution = cluster.load("e1").await;
    assert_eq!(execution.status, ExecutionStatus::Canceled);
    assert!(execution.canceled);
    assert_eq!(execution.canceled_by.as_deref(), Some("ops"));
    assert_eq!(execution.cancellation_reason.as_deref(), Some("bad build"));
    assert_eq!(execution.stages[0].status, ExecutionStatus::Canceled);
    assert_eq!(execution.stages[0].tasks[0].status, TaskStatus::Canceled);
    assert_eq!(execution.stages[1].status, ExecutionStatus::Canceled);

    assert_eq!(
        node.engine.cancel("e1", None, None).await.unwrap(),
        ControlOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_pause_excludes_paused_time_from_timeout() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(Stage::new("s1", "wait").with_task(Task::new("t1", "wait", secs(10), secs(60))));
    cluster.seed(&execution).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.step().await;

    cluster.advance(Duration::seconds(5));
    node.engine.pause("e1", Some("ops".to_string())).await.unwrap();
    assert_eq!(
        node.engine.pause("e1", None).await.unwrap(),
        ControlOutcome::Unchanged
    );

    // the run due at +10s finds the execution paused and is dropped
    cluster.advance(Duration::seconds(100));
    node.run_until_idle(5).await;
    let execution = cluster.load("e1").await;
    assert_eq!(execution.status, ExecutionStatus::Paused);
    assert_eq!(execution.stages[0].status, ExecutionStatus::Paused);
    assert_eq!(execution.stages[0].tasks[0].attempts, 1);

    let outcome = node
        .engine
        .resume("e1", Some("ops".to_string()), false)
        .await
        .unwrap();
    let ControlOutcome::Applied(runs) = outcome else {
        panic!("resume should apply");
    };
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].not_before, epoch() + Duration::seconds(110));

    let execution = cluster.load("e1").await;
    let task = &execution.stages[0].tasks[0];
    assert_eq!(task.paused_ms, 100_000);
    assert_eq!(task.elapsed(runs[0].not_before), Duration::seconds(10));
    let paused = execution.paused.unwrap();
    assert_eq!(paused.paused_by.as_deref(), Some("ops"));
    assert_eq!(paused.resume_time, Some(epoch() + Duration::seconds(105)));

    node.step().await;
    let execution = cluster.load("e1").await;
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.stages[0].tasks[0].attempts, 2);
}

#[tokio::test]
async fn test_pause_and_resume_guard_status() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "wait", "ok")).await;
    let node = cluster.node(Some("a")).await;

    let err = node.engine.pause("e1", None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOperation { .. }));

    node.engine.start("e1").await.unwrap();
    assert_eq!(
        node.engine.resume("e1", None, false).await.unwrap(),
        ControlOutcome::Unchanged
    );
    // forcing a resume of a running execution reissues its runs
    let outcome = node.engine.resume("e1", None, true).await.unwrap();
    assert!(matches!(outcome, ControlOutcome::Applied(ref runs) if runs.len() == 1));
}

#[tokio::test]
async fn test_restart_stage_resets_downstream() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "ok", "wait")).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.step().await;
    node.step().await;

    let err = node.engine.restart_stage("e1", "s2").await.unwrap_err();
    assert!(matches!(err, Error::InvalidOperation { .. }));

    node.engine.restart_stage("e1", "s1").await.unwrap();
    let execution = cluster.load("e1").await;
    let s1 = execution.stage("s1").unwrap();
    let s2 = execution.stage("s2").unwrap();
    assert_eq!(s1.attempt, 2);
    assert_eq!(s1.status, ExecutionStatus::Running);
    assert_eq!(s2.attempt, 2);
    assert_eq!(s2.status, ExecutionStatus::NotStarted);
    assert_eq!(s2.tasks[0].attempts, 0);

    // a replay pinned to the first attempt is stale
    let mut replay = execution.clone();
    let err = state::restart_stage(&mut replay, "s1", 1, cluster.now()).unwrap_err();
    assert!(matches!(err, Error::StaleEvent { .. }));

    node.step().await;
    let execution = cluster.load("e1").await;
    assert_eq!(execution.stage("s1").unwrap().status, ExecutionStatus::Succeeded);
    assert_eq!(execution.stage("s2").unwrap().status, ExecutionStatus::Running);
}

#[tokio::test]
async fn test_restart_rejected_once_complete() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "ok", "ok")).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.run_until_idle(5).await;

    let err = node.engine.restart_stage("e1", "s1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidOperation { .. }));
}

#[tokio::test]
async fn test_patch_stage_is_visible_to_next_invocation() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(Stage::new("s1", "echo").with_task(task("t1", "echo")));
    cluster.seed(&execution).await;
    let mut node = cluster.node(Some("a")).await;
    node.engine.start("e1").await.unwrap();

    let mut patch = Map::new();
    patch.insert("input".to_string(), json!(42));
    assert!(matches!(
        node.engine.patch_stage("e1", "s1", patch.clone()).await.unwrap(),
        ControlOutcome::Applied(_)
    ));
    assert_eq!(
        node.engine.patch_stage("e1", "s1", patch).await.unwrap(),
        ControlOutcome::Unchanged
    );

    let err = node
        .engine
        .patch_stage("e1", "missing", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StageNotFound { .. }));

    node.run_until_idle(5).await;
    assert_eq!(
        cluster.load("e1").await.stages[0].context.get("seen"),
        Some(&json!(42))
    );
}

#[tokio::test]
async fn test_delete_removes_execution_and_drops_its_runs() {
    let mut registry = TaskRegistry::new();
    let calls = counting(&mut registry, "poll", TaskResult::running());
    let cluster = Cluster::new(registry);
    cluster.seed(&linear("a", "poll", "poll")).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    assert_eq!(
        node.engine.delete("e1").await.unwrap(),
        ControlOutcome::Applied(Vec::new())
    );
    assert!(cluster.storage.is_empty().await);

    node.run_until_idle(5).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let err = node.engine.delete("e1").await.unwrap_err();
    assert!(matches!(err, Error::ExecutionNotFound(_)));
}

#[tokio::test]
async fn test_continue_on_failure_lets_downstream_run() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(
            Stage::new("s1", "canary")
                .with_task(task("t1", "fail"))
                .with_task(task("t2", "ok"))
                .continue_on_failure(true)
                .with_child("s2"),
        )
        .with_stage(Stage::new("s2", "deploy").with_task(task("t1", "ok")));
    cluster.seed(&execution).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.run_until_idle(5).await;

    let execution = cluster.load("e1").await;
    let s1 = execution.stage("s1").unwrap();
    assert_eq!(s1.status, ExecutionStatus::FailedContinue);
    assert_eq!(s1.tasks[0].error.as_deref(), Some("boom"));
    assert_eq!(s1.tasks[1].status, TaskStatus::Canceled);
    assert_eq!(execution.stage("s2").unwrap().status, ExecutionStatus::Succeeded);
    assert_eq!(execution.status, ExecutionStatus::FailedContinue);
}

#[tokio::test]
async fn test_terminal_stage_cancels_the_rest() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(Stage::new("s1", "deploy").with_task(task("t1", "fail")))
        .with_stage(Stage::new("s2", "deploy").with_task(task("t1", "wait")));
    cluster.seed(&execution).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.run_until_idle(5).await;

    let execution = cluster.load("e1").await;
    assert_eq!(execution.status, ExecutionStatus::Terminal);
    assert_eq!(execution.stage("s1").unwrap().status, ExecutionStatus::Terminal);
    assert_eq!(execution.stage("s2").unwrap().status, ExecutionStatus::Canceled);
    assert_eq!(
        execution.stage("s2").unwrap().tasks[0].status,
        TaskStatus::Canceled
    );
}

#[tokio::test]
async fn test_disabled_stage_is_skipped() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(
            Stage::new("s1", "manual")
                .with_task(task("t1", "fail"))
                .enabled(false)
                .with_child("s2"),
        )
        .with_stage(Stage::new("s2", "deploy").with_task(task("t1", "ok")));
    cluster.seed(&execution).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.run_until_idle(5).await;

    let execution = cluster.load("e1").await;
    assert_eq!(execution.stage("s1").unwrap().status, ExecutionStatus::Skipped);
    assert_eq!(execution.stage("s1").unwrap().tasks[0].status, TaskStatus::NotStarted);
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn test_stage_without_tasks_succeeds_immediately() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(Stage::new("s1", "noop"));
    cluster.seed(&execution).await;
    let node = cluster.node(Some("a")).await;

    let outcome = node.engine.start("e1").await.unwrap();
    assert_eq!(outcome, ControlOutcome::Applied(Vec::new()));
    assert_eq!(cluster.load("e1").await.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn test_unknown_implementation_is_terminal() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "no-such-task", "ok")).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.run_until_idle(5).await;

    let execution = cluster.load("e1").await;
    assert_eq!(execution.status, ExecutionStatus::Terminal);
    let error = execution.stages[0].tasks[0].error.clone().unwrap();
    assert!(error.contains("no-such-task"));
}

#[tokio::test]
async fn test_handler_errors_follow_retryable_flag() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = TaskRegistry::new();
    let counter = attempts.clone();
    registry.register_fn("flaky", move |_| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow::anyhow!("connection reset"))
            } else {
                Ok(TaskResult::succeeded())
            }
        }
    });
    let cluster = Cluster::new(registry);
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(Stage::new("s1", "deploy").with_task(task("t1", "flaky")))
        .with_stage(Stage::new("s2", "deploy").with_task(task("t2", "flaky").retryable(false)));
    cluster.seed(&execution).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    // both stages are roots; t2 fails once without retry, t1 retries
    node.run_until_idle(10).await;

    let execution = cluster.load("e1").await;
    let t2 = &execution.stage("s2").unwrap().tasks[0];
    assert_eq!(t2.status, TaskStatus::Terminal);
    assert!(t2.error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(execution.status, ExecutionStatus::Terminal);
}

#[tokio::test]
async fn test_retryable_error_is_retried_after_backoff() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = TaskRegistry::new();
    let counter = attempts.clone();
    registry.register_fn("flaky", move |_| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow::anyhow!("connection reset"))
            } else {
                Ok(TaskResult::succeeded())
            }
        }
    });
    let cluster = Cluster::new(registry);
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(Stage::new("s1", "deploy").with_task(task("t1", "flaky")));
    cluster.seed(&execution).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.run_until_idle(10).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let times: Vec<_> = node.invoked.iter().map(|r| r.not_before).collect();
    assert_eq!(
        times,
        vec![epoch(), epoch() + Duration::seconds(1), epoch() + Duration::seconds(2)]
    );
    let execution = cluster.load("e1").await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.stages[0].tasks[0].attempts, 3);
    assert_eq!(execution.stages[0].tasks[0].error, None);
}

#[tokio::test]
async fn test_invalid_graph_is_not_started() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(Stage::new("s1", "a").with_child("s2"))
        .with_stage(Stage::new("s2", "b").with_child("s1"));
    cluster.seed(&execution).await;
    let node = cluster.node(Some("a")).await;

    let err = node.engine.start("e1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidGraph { .. }));
    assert_eq!(cluster.load("e1").await.status, ExecutionStatus::NotStarted);
}

#[test]
fn test_graph_validation_rejects_bad_references() {
    let unknown = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_stage(Stage::new("s1", "a").with_child("ghost"));
    assert!(matches!(
        state::validate_graph(&unknown),
        Err(Error::InvalidGraph { .. })
    ));

    let duplicate = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_stage(Stage::new("s1", "a"))
        .with_stage(Stage::new("s1", "b"));
    assert!(matches!(
        state::validate_graph(&duplicate),
        Err(Error::InvalidGraph { .. })
    ));

    let diamond = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_stage(Stage::new("s1", "a").with_child("s2").with_child("s3"))
        .with_stage(Stage::new("s2", "a").with_child("s4"))
        .with_stage(Stage::new("s3", "a").with_child("s4"))
        .with_stage(Stage::new("s4", "a"));
    assert!(state::validate_graph(&diamond).is_ok());
}

#[test]
fn test_result_for_an_old_invocation_is_dropped() {
    let now = epoch();
    let mut execution = linear("a", "wait", "ok");
    state::start(&mut execution, now).unwrap();
    let snapshot = state::runnable(&execution, "s1", "t1").unwrap();

    let first = state::apply_invocation(
        &mut execution,
        "s1",
        "t1",
        snapshot,
        Invocation::Reported(TaskResult::running()),
        now,
    )
    .unwrap();
    assert!(first.changed);

    let replay = state::apply_invocation(
        &mut execution,
        "s1",
        "t1",
        snapshot,
        Invocation::Reported(TaskResult::succeeded()),
        now,
    )
    .unwrap();
    assert_eq!(replay, Change::unchanged());
    assert_eq!(execution.stages[0].tasks[0].status, TaskStatus::Running);
    assert_eq!(execution.stages[0].tasks[0].attempts, 1);
}

#[test]
fn test_start_of_complete_execution_is_rejected() {
    let mut execution = linear("a", "ok", "ok");
    execution.status = ExecutionStatus::Canceled;

    let err = state::start(&mut execution, epoch()).unwrap_err();
    assert!(matches!(err, Error::InvalidOperation { .. }));
}

#[tokio::test]
async fn test_recover_reissues_runs_after_a_crash() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "ok", "ok")).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.drop_pending();

    let mut other = cluster.node(Some("b")).await;
    assert!(other.engine.recover().await.unwrap().is_empty());

    let runs = node.engine.recover().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].task_id, "t1");
    node.run_until_idle(5).await;
    assert_eq!(cluster.load("e1").await.status, ExecutionStatus::Succeeded);
    assert!(other.pending().is_empty());
}

#[tokio::test]
async fn test_foreign_start_is_refused() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "ok", "ok")).await;
    let node = cluster.node(Some("b")).await;

    let err = node.engine.start("e1").await.unwrap_err();
    assert!(matches!(err, Error::ForeignExecution { ref served, .. } if served == "b"));
}

#[tokio::test]
async fn test_foreign_control_without_interlink_is_refused() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "ok", "ok")).await;
    let repository = Arc::new(cluster.storage.for_partition(Some("b".to_string())));
    let engine = Engine::builder(repository, cluster.retriable_lock("b"), cluster.registry.clone())
        .settings(fast_settings())
        .build();

    assert!(!engine.interlink_enabled());
    let err = engine.cancel("e1", None, None).await.unwrap_err();
    assert!(matches!(err, Error::ForeignExecution { .. }));
}

#[tokio::test]
async fn test_contended_execution_lock_is_retryable() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "ok", "ok")).await;
    let node = cluster.node(Some("a")).await;

    let other = cluster.retriable_lock("intruder");
    assert!(other
        .lock()
        .acquire(&Engine::lock_name("e1"), "intruder:1", secs(30))
        .await
        .unwrap());

    let err = node.engine.start("e1").await.unwrap_err();
    assert!(matches!(err, Error::FailedToAcquireLock { attempts: 4, .. }));
    assert!(err.is_retryable());
    assert_eq!(cluster.load("e1").await.status, ExecutionStatus::NotStarted);
}

/// An engine on tokio's clock, wired to feed a scheduler
fn paused_engine(
    registry: TaskRegistry,
) -> (
    Arc<Engine>,
    Arc<InMemoryExecutionRepository>,
    mpsc::UnboundedSender<TaskRun>,
    mpsc::UnboundedReceiver<TaskRun>,
) {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let store = Arc::new(InMemoryLockStore::with_clock(clock.clone()));
    let lock = RetriableLock::new(DistributedLock::new(store, secs(2)), "node");
    let repository = Arc::new(InMemoryExecutionRepository::new(None));
    let (sink, inbox) = mpsc::unbounded_channel();

    let engine = Arc::new(
        Engine::builder(repository.clone(), lock, Arc::new(registry))
            .clock(clock)
            .settings(fast_settings())
            .run_sink(sink.clone())
            .build(),
    );
    (engine, repository, sink, inbox)
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_drives_execution_to_completion() {
    let polls = Arc::new(AtomicU32::new(0));
    let mut registry = TaskRegistry::new();
    let counter = polls.clone();
    registry.register_fn("poll", move |_| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok::<_, anyhow::Error>(TaskResult::running())
            } else {
                Ok(TaskResult::succeeded())
            }
        }
    });
    registry.register_fn("ok", |_| async { Ok::<_, anyhow::Error>(TaskResult::succeeded()) });

    let (engine, repository, sink, inbox) = paused_engine(registry);
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(
            Stage::new("s1", "wait")
                .with_task(Task::new("t1", "poll", secs(5), secs(60)))
                .with_child("s2"),
        )
        .with_stage(Stage::new("s2", "deploy").with_task(task("t2", "ok")));
    repository.save(&execution).await.unwrap();

    let shutdown = CancellationToken::new();
    let settings = SchedulerSettings {
        recovery_interval: secs(300),
        ..SchedulerSettings::default()
    };
    let scheduler = Scheduler::new(engine.clone(), inbox, sink, settings);
    let running = tokio::spawn(scheduler.run(shutdown.clone()));
    // let the startup recovery pass go by first
    tokio::time::sleep(StdDuration::from_millis(10)).await;

    engine.start("e1").await.unwrap();
    for _ in 0..60 {
        if repository.load("e1").await.unwrap().is_complete() {
            break;
        }
        tokio::time::sleep(secs(1)).await;
    }

    let execution = repository.load("e1").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(polls.load(Ordering::SeqCst), 3);
    let t1 = &execution.stages[0].tasks[0];
    assert!(t1.ended_at.unwrap() - t1.started_at.unwrap() >= Duration::seconds(10));

    shutdown.cancel();
    running.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recovery_never_overlaps_an_executing_task() {
    let calls = Arc::new(AtomicU32::new(0));
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let mut registry = TaskRegistry::new();
    {
        let (calls, active, peak) = (calls.clone(), active.clone(), peak.clone());
        registry.register_fn("slow", move |_| {
            let (calls, active, peak) = (calls.clone(), active.clone(), peak.clone());
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now_active, Ordering::SeqCst);
                tokio::time::sleep(secs(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(TaskResult::running())
            }
        });
    }
    let (engine, repository, sink, inbox) = paused_engine(registry);
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(Stage::new("s1", "bake").with_task(Task::new("t1", "slow", secs(30), secs(600))));
    repository.save(&execution).await.unwrap();

    let shutdown = CancellationToken::new();
    let settings = SchedulerSettings {
        recovery_interval: secs(2),
        ..SchedulerSettings::default()
    };
    let running = tokio::spawn(Scheduler::new(engine.clone(), inbox, sink, settings).run(shutdown.clone()));
    tokio::time::sleep(StdDuration::from_millis(10)).await;

    engine.start("e1").await.unwrap();
    // recovery ticks every 2s while the first invocation takes 5s
    tokio::time::sleep(secs(20)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    // the next invocation is one 30s backoff away
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let t1 = &repository.load("e1").await.unwrap().stages[0].tasks[0];
    assert_eq!(t1.attempts, 1);

    shutdown.cancel();
    running.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_saturated_scheduler_still_shuts_down() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = TaskRegistry::new();
    {
        let (gate, calls) = (gate.clone(), calls.clone());
        registry.register_fn("gated", move |_| {
            let (gate, calls) = (gate.clone(), calls.clone());
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    gate.notified().await;
                }
                Ok::<_, anyhow::Error>(TaskResult::succeeded())
            }
        });
    }
    let (engine, repository, sink, inbox) = paused_engine(registry);
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(Stage::new("s1", "deploy").with_task(Task::new("t", "gated", secs(1), secs(600))))
        .with_stage(Stage::new("s2", "deploy").with_task(Task::new("t", "gated", secs(1), secs(600))));
    repository.save(&execution).await.unwrap();

    let shutdown = CancellationToken::new();
    let settings = SchedulerSettings {
        max_concurrency: 1,
        recovery_interval: secs(300),
        ..SchedulerSettings::default()
    };
    let running = tokio::spawn(Scheduler::new(engine.clone(), inbox, sink, settings).run(shutdown.clone()));
    tokio::time::sleep(StdDuration::from_millis(10)).await;

    let outcome = engine.start("e1").await.unwrap();
    assert!(matches!(outcome, ControlOutcome::Applied(ref runs) if runs.len() == 2));
    tokio::time::sleep(secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the only permit is taken; shutdown must still be noticed
    shutdown.cancel();
    tokio::time::sleep(StdDuration::from_millis(10)).await;
    gate.notify_one();
    running.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let execution = repository.load("e1").await.unwrap();
    assert_eq!(execution.stages.iter().map(|s| s.tasks[0].attempts).sum::<u32>(), 1);
}

#[tokio::test]
async fn test_unschedulable_backoff_is_rejected_at_start() {
    let cluster = Cluster::new(registry());
    let execution = Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(
            Stage::new("s1", "wait").with_task(Task::new("t1", "wait", secs(1 << 45), secs(60))),
        );
    cluster.seed(&execution).await;
    let node = cluster.node(Some("a")).await;

    let err = node.engine.start("e1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidOperation { ref reason, .. } if reason.contains("backoff")));
    assert_eq!(cluster.load("e1").await.status, ExecutionStatus::NotStarted);
    assert!(cluster
        .locks
        .get(&Engine::lock_name("e1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unschedulable_backoff_fails_a_running_task() {
    let cluster = Cluster::new(registry());
    cluster.seed(&linear("a", "wait", "ok")).await;
    let mut node = cluster.node(Some("a")).await;
    node.engine.start("e1").await.unwrap();

    // a stored body carrying a backoff no timestamp can hold
    let mut stored = cluster.load("e1").await;
    stored.stages[0].tasks[0].backoff_period_ms = u64::MAX;
    cluster.seed(&stored).await;
    node.step().await;

    let execution = cluster.load("e1").await;
    let t1 = &execution.stages[0].tasks[0];
    assert_eq!(t1.status, TaskStatus::Terminal);
    assert!(t1.error.as_deref().unwrap().contains("cannot be scheduled"));
    assert_eq!(execution.status, ExecutionStatus::Terminal);
    assert!(cluster
        .locks
        .get(&Engine::lock_name("e1"))
        .await
        .unwrap()
        .is_none());
}

fn stage_with_timeout() -> Execution {
    Execution::new(ExecutionType::Pipeline, "app", "a")
        .with_id("e1")
        .with_stage(
            Stage::new("s1", "wait")
                .with_timeout(secs(30))
                .with_task(Task::new("t1", "wait", secs(10), secs(600))),
        )
}

#[tokio::test]
async fn test_stage_timeout_bounds_its_tasks() {
    let cluster = Cluster::new(registry());
    cluster.seed(&stage_with_timeout()).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    // epoch, +10s and +20s are well inside the stage timeout
    assert_eq!(node.run_until_idle(3).await, 3);
    assert_eq!(cluster.load("e1").await.status, ExecutionStatus::Running);

    node.run_until_idle(5).await;
    assert!(cluster.now() <= epoch() + Duration::seconds(40));

    let execution = cluster.load("e1").await;
    let t1 = &execution.stages[0].tasks[0];
    assert_eq!(t1.status, TaskStatus::Terminal);
    assert!(t1.error.as_deref().unwrap().starts_with(state::STAGE_TIMEOUT_EXCEEDED));
    assert_eq!(execution.stages[0].status, ExecutionStatus::Terminal);
    assert_eq!(execution.status, ExecutionStatus::Terminal);
}

#[tokio::test]
async fn test_stage_timeout_excludes_paused_time() {
    let cluster = Cluster::new(registry());
    cluster.seed(&stage_with_timeout()).await;
    let mut node = cluster.node(Some("a")).await;

    node.engine.start("e1").await.unwrap();
    node.step().await;
    cluster.advance(Duration::seconds(5));
    node.engine.pause("e1", None).await.unwrap();
    cluster.advance(Duration::seconds(100));
    node.engine.resume("e1", None, false).await.unwrap();

    // due at +110s, 10s of unpaused stage time
    node.step().await;
    assert_eq!(cluster.now(), epoch() + Duration::seconds(110));

    let execution = cluster.load("e1").await;
    assert_eq!(execution.stages[0].paused_ms, 100_000);
    assert_eq!(execution.stages[0].tasks[0].status, TaskStatus::Running);
    assert_eq!(execution.stages[0].tasks[0].attempts, 2);
}
