//! Pure state transitions over an [`Execution`]
//!
//! Nothing here does I/O. The engine loads an execution under its lock, runs
//! one of these functions, persists the result when it reports a change, and
//! hands the returned task runs to the scheduler.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet, VecDeque};

use super::registry::{TaskOutcome, TaskResult};
use crate::error::{Error, Result};
use crate::types::{millis, Execution, ExecutionStatus, PausedDetails, TaskStatus};

pub const TASK_TIMEOUT_EXCEEDED: &str = "TaskTimeoutExceeded";
pub const STAGE_TIMEOUT_EXCEEDED: &str = "StageTimeoutExceeded";

/// A request to invoke one task no earlier than `not_before`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRun {
    pub execution_id: String,
    pub stage_id: String,
    pub task_id: String,
    pub not_before: DateTime<Utc>,
}

pub type RunKey = (String, String, String);

impl TaskRun {
    pub fn key(&self) -> RunKey {
        (
            self.execution_id.clone(),
            self.stage_id.clone(),
            self.task_id.clone(),
        )
    }

    pub fn at(&self, not_before: DateTime<Utc>) -> Self {
        Self {
            not_before,
            ..self.clone()
        }
    }
}

/// Result of one transition batch
#[derive(Debug, Default, PartialEq)]
pub struct Change {
    pub changed: bool,
    pub runs: Vec<TaskRun>,
}

impl Change {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed(runs: Vec<TaskRun>) -> Self {
        Self {
            changed: true,
            runs,
        }
    }
}

/// Identity of one task invocation; a result only applies to the invocation it
/// was produced by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
}

/// How an invocation ended, as seen by the engine
#[derive(Debug, Clone)]
pub enum Invocation {
    Reported(TaskResult),
    Failed { error: String, retry: bool },
    TimedOut { elapsed: Duration },
    /// The enclosing stage ran past its own timeout
    StageTimedOut { elapsed: Duration },
}

pub fn validate_graph(execution: &Execution) -> Result<()> {
    let invalid = |reason: String| Error::InvalidGraph {
        execution_id: execution.id.clone(),
        reason,
    };

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for stage in &execution.stages {
        if in_degree.insert(stage.id.as_str(), 0).is_some() {
            return Err(invalid(format!("duplicate stage id '{}'", stage.id)));
        }
    }
    for stage in &execution.stages {
        for child in &stage.children {
            match in_degree.get_mut(child.as_str()) {
                Some(degree) => *degree += 1,
                None => {
                    return Err(invalid(format!(
                        "stage '{}' lists unknown child '{}'",
                        stage.id, child
                    )))
                }
            }
        }
    }

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = ready.pop_front() {
        visited += 1;
        if let Some(stage) = execution.stage(id) {
            for child in &stage.children {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(child.as_str());
                    }
                }
            }
        }
    }

    if visited != execution.stages.len() {
        return Err(invalid("stage graph contains a cycle".to_string()));
    }
    Ok(())
}

/// Every backoff and timeout must be schedulable from `now`
pub fn validate_timings(execution: &Execution, now: DateTime<Utc>) -> Result<()> {
    let out_of_range = |what: String, ms: u64| Error::InvalidOperation {
        execution_id: execution.id.clone(),
        reason: format!("{} of {}ms is out of range", what, ms),
    };
    let schedulable = |ms: u64| now.checked_add_signed(millis(ms)).is_some();

    for stage in &execution.stages {
        if let Some(timeout_ms) = stage.timeout_ms {
            if !schedulable(timeout_ms) {
                return Err(out_of_range(format!("stage {} timeout", stage.id), timeout_ms));
            }
        }
        for task in &stage.tasks {
            if !schedulable(task.backoff_period_ms) {
                return Err(out_of_range(
                    format!("task {} backoff period", task.id),
                    task.backoff_period_ms,
                ));
            }
            if !schedulable(task.timeout_ms) {
                return Err(out_of_range(format!("task {} timeout", task.id), task.timeout_ms));
            }
        }
    }
    Ok(())
}

pub fn start(execution: &mut Execution, now: DateTime<Utc>) -> Result<Change> {
    match execution.status {
        ExecutionStatus::Running | ExecutionStatus::Paused => return Ok(Change::unchanged()),
        status if status.is_complete() => {
            return Err(Error::InvalidOperation {
                execution_id: execution.id.clone(),
                reason: format!("cannot start an execution that is {}", status),
            })
        }
        _ => {}
    }

    validate_graph(execution)?;
    validate_timings(execution, now)?;
    execution.set_status(ExecutionStatus::Running)?;
    execution.start_time = Some(now);
    let runs = advance(execution, now)?;
    Ok(Change::changed(runs))
}

/// Start every stage whose parents allow it, then complete the execution if
/// nothing is left to do
fn advance(execution: &mut Execution, now: DateTime<Utc>) -> Result<Vec<TaskRun>> {
    let mut runs = Vec::new();
    if execution.status != ExecutionStatus::Running {
        return Ok(runs);
    }

    loop {
        let ready: Vec<usize> = execution
            .stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| stage.status == ExecutionStatus::NotStarted)
            .filter(|(_, stage)| {
                execution.parent_ids(&stage.id).iter().all(|parent| {
                    execution
                        .stage(parent)
                        .map(|p| p.status.allows_downstream())
                        .unwrap_or(false)
                })
            })
            .map(|(idx, _)| idx)
            .collect();

        if ready.is_empty() {
            break;
        }

        for idx in ready {
            let stage = &mut execution.stages[idx];
            stage.start_time = Some(now);
            if !stage.enabled {
                stage.set_status(ExecutionStatus::Skipped)?;
                stage.end_time = Some(now);
                continue;
            }
            stage.set_status(ExecutionStatus::Running)?;
            if stage.tasks.is_empty() {
                stage.set_status(ExecutionStatus::Succeeded)?;
                stage.end_time = Some(now);
                continue;
            }
            runs.push(start_task(execution, idx, 0, now)?);
        }
    }

    finalize(execution, now)?;
    Ok(runs)
}

fn start_task(
    execution: &mut Execution,
    stage_idx: usize,
    task_idx: usize,
    now: DateTime<Utc>,
) -> Result<TaskRun> {
    let execution_id = execution.id.clone();
    let stage = &mut execution.stages[stage_idx];
    let stage_id = stage.id.clone();
    let task = &mut stage.tasks[task_idx];

    task.set_status(TaskStatus::Running)?;
    task.started_at = Some(now);
    task.next_attempt_at = Some(now);
    task.error = None;

    Ok(TaskRun {
        execution_id,
        stage_id,
        task_id: task.id.clone(),
        not_before: now,
    })
}

fn finalize(execution: &mut Execution, now: DateTime<Utc>) -> Result<()> {
    if execution.is_complete() || !execution.stages.iter().all(|s| s.status.is_complete()) {
        return Ok(());
    }

    let any = |status: ExecutionStatus| execution.stages.iter().any(|s| s.status == status);
    let status = if any(ExecutionStatus::Terminal) {
        ExecutionStatus::Terminal
    } else if any(ExecutionStatus::FailedContinue) {
        ExecutionStatus::FailedContinue
    } else {
        ExecutionStatus::Succeeded
    };

    execution.set_status(status)?;
    execution.end_time = Some(now);
    Ok(())
}

fn locate(execution: &Execution, stage_id: &str, task_id: &str) -> Result<(usize, usize)> {
    let stage_idx = execution
        .stages
        .iter()
        .position(|s| s.id == stage_id)
        .ok_or_else(|| Error::StageNotFound {
            execution_id: execution.id.clone(),
            stage_id: stage_id.to_string(),
        })?;
    let task_idx = execution.stages[stage_idx]
        .tasks
        .iter()
        .position(|t| t.id == task_id)
        .ok_or_else(|| Error::TaskNotFound {
            stage_id: stage_id.to_string(),
            task_id: task_id.to_string(),
        })?;
    Ok((stage_idx, task_idx))
}

/// The snapshot a run must present for its result to be applied, or `None`
/// when the task should not be invoked at all
pub fn runnable(execution: &Execution, stage_id: &str, task_id: &str) -> Option<TaskSnapshot> {
    if execution.status != ExecutionStatus::Running {
        return None;
    }
    let stage = execution.stage(stage_id)?;
    if stage.status != ExecutionStatus::Running {
        return None;
    }
    let task = stage.task(task_id)?;
    if task.status != TaskStatus::Running {
        return None;
    }
    Some(TaskSnapshot {
        attempts: task.attempts,
        started_at: task.started_at,
    })
}

/// Apply the outcome of one invocation
///
/// Results for an invocation that no longer matches the task (restarted,
/// canceled, already applied) are dropped without change.
pub fn apply_invocation(
    execution: &mut Execution,
    stage_id: &str,
    task_id: &str,
    snapshot: TaskSnapshot,
    invocation: Invocation,
    now: DateTime<Utc>,
) -> Result<Change> {
    if runnable(execution, stage_id, task_id) != Some(snapshot) {
        return Ok(Change::unchanged());
    }
    let (stage_idx, task_idx) = locate(execution, stage_id, task_id)?;
    execution.stages[stage_idx].tasks[task_idx].attempts += 1;

    match invocation {
        Invocation::Reported(result) => {
            let stage = &mut execution.stages[stage_idx];
            stage.context.extend(result.outputs);
            match result.outcome {
                TaskOutcome::Succeeded => succeed_task(execution, stage_idx, task_idx, now),
                TaskOutcome::Running => reschedule(execution, stage_idx, task_idx, now),
                TaskOutcome::Terminal => {
                    let error = result
                        .error
                        .unwrap_or_else(|| "task reported a terminal failure".to_string());
                    fail_task(execution, stage_idx, task_idx, error, now)
                }
            }
        }
        Invocation::Failed { error, retry: true } => {
            execution.stages[stage_idx].tasks[task_idx].error = Some(error);
            reschedule(execution, stage_idx, task_idx, now)
        }
        Invocation::Failed { error, retry: false } => {
            fail_task(execution, stage_idx, task_idx, error, now)
        }
        Invocation::TimedOut { elapsed } => {
            let timeout_ms = execution.stages[stage_idx].tasks[task_idx].timeout_ms;
            let error = format!(
                "{}: ran for {}ms, timeout is {}ms",
                TASK_TIMEOUT_EXCEEDED,
                elapsed.num_milliseconds(),
                timeout_ms
            );
            fail_task(execution, stage_idx, task_idx, error, now)
        }
        Invocation::StageTimedOut { elapsed } => {
            let timeout_ms = execution.stages[stage_idx].timeout_ms.unwrap_or_default();
            let error = format!(
                "{}: stage ran for {}ms, timeout is {}ms",
                STAGE_TIMEOUT_EXCEEDED,
                elapsed.num_milliseconds(),
                timeout_ms
            );
            fail_task(execution, stage_idx, task_idx, error, now)
        }
    }
}

/// Schedule the next invocation one backoff period out
///
/// A backoff that cannot be represented as a timestamp fails the task.
fn reschedule(
    execution: &mut Execution,
    stage_idx: usize,
    task_idx: usize,
    now: DateTime<Utc>,
) -> Result<Change> {
    let backoff_period_ms = execution.stages[stage_idx].tasks[task_idx].backoff_period_ms;
    let Some(next) = now.checked_add_signed(millis(backoff_period_ms)) else {
        let error = format!("backoff period of {}ms cannot be scheduled", backoff_period_ms);
        return fail_task(execution, stage_idx, task_idx, error, now);
    };

    let execution_id = execution.id.clone();
    let stage = &mut execution.stages[stage_idx];
    let task = &mut stage.tasks[task_idx];
    task.next_attempt_at = Some(next);

    Ok(Change::changed(vec![TaskRun {
        execution_id,
        stage_id: stage.id.clone(),
        task_id: task.id.clone(),
        not_before: next,
    }]))
}

fn succeed_task(
    execution: &mut Execution,
    stage_idx: usize,
    task_idx: usize,
    now: DateTime<Utc>,
) -> Result<Change> {
    {
        let task = &mut execution.stages[stage_idx].tasks[task_idx];
        task.set_status(TaskStatus::Succeeded)?;
        task.ended_at = Some(now);
        task.next_attempt_at = None;
        task.error = None;
    }

    let next_task = execution.stages[stage_idx]
        .tasks
        .iter()
        .position(|t| t.status == TaskStatus::NotStarted);
    if let Some(next_idx) = next_task {
        let run = start_task(execution, stage_idx, next_idx, now)?;
        return Ok(Change::changed(vec![run]));
    }

    let stage = &mut execution.stages[stage_idx];
    stage.set_status(ExecutionStatus::Succeeded)?;
    stage.end_time = Some(now);
    Ok(Change::changed(advance(execution, now)?))
}

fn fail_task(
    execution: &mut Execution,
    stage_idx: usize,
    task_idx: usize,
    error: String,
    now: DateTime<Utc>,
) -> Result<Change> {
    let stage = &mut execution.stages[stage_idx];
    let task = &mut stage.tasks[task_idx];
    task.set_status(TaskStatus::Terminal)?;
    task.ended_at = Some(now);
    task.next_attempt_at = None;
    task.error = Some(error);

    stage.end_time = Some(now);
    if stage.continue_on_failure {
        for task in stage.tasks.iter_mut().filter(|t| !t.status.is_complete()) {
            task.set_status(TaskStatus::Canceled)?;
            task.ended_at = Some(now);
        }
        stage.set_status(ExecutionStatus::FailedContinue)?;
        return Ok(Change::changed(advance(execution, now)?));
    }

    stage.set_status(ExecutionStatus::Terminal)?;
    cancel_in_flight(execution, now)?;
    execution.set_status(ExecutionStatus::Terminal)?;
    execution.end_time = Some(now);
    Ok(Change::changed(Vec::new()))
}

/// Move every non-complete task and stage to CANCELED
fn cancel_in_flight(execution: &mut Execution, now: DateTime<Utc>) -> Result<()> {
    for stage in &mut execution.stages {
        for task in stage.tasks.iter_mut().filter(|t| !t.status.is_complete()) {
            task.set_status(TaskStatus::Canceled)?;
            task.ended_at = Some(now);
            task.next_attempt_at = None;
        }
        if !stage.status.is_complete() {
            stage.set_status(ExecutionStatus::Canceled)?;
            stage.end_time = Some(now);
        }
    }
    Ok(())
}

pub fn cancel(
    execution: &mut Execution,
    user: Option<String>,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<Change> {
    if execution.is_complete() {
        return Ok(Change::unchanged());
    }

    execution.canceled = true;
    execution.canceled_by = user;
    execution.cancellation_reason = reason;
    cancel_in_flight(execution, now)?;
    execution.set_status(ExecutionStatus::Canceled)?;
    execution.end_time = Some(now);
    Ok(Change::changed(Vec::new()))
}

pub fn pause(execution: &mut Execution, user: Option<String>, now: DateTime<Utc>) -> Result<Change> {
    match execution.status {
        ExecutionStatus::Paused => return Ok(Change::unchanged()),
        ExecutionStatus::Running => {}
        status => {
            return Err(Error::InvalidOperation {
                execution_id: execution.id.clone(),
                reason: format!("cannot pause an execution that is {}", status),
            })
        }
    }

    execution.set_status(ExecutionStatus::Paused)?;
    execution.paused = Some(PausedDetails {
        paused_by: user,
        pause_time: now,
        resumed_by: None,
        resume_time: None,
    });
    for stage in execution
        .stages
        .iter_mut()
        .filter(|s| s.status == ExecutionStatus::Running)
    {
        stage.set_status(ExecutionStatus::Paused)?;
    }
    Ok(Change::changed(Vec::new()))
}

/// Resume a paused execution
///
/// Time spent paused is credited to running tasks so it does not count toward
/// their timeout, and their next attempt moves out by the same amount. With
/// `ignore_current_status` a RUNNING execution has its running tasks
/// rescheduled and a NOT_STARTED one is started.
pub fn resume(
    execution: &mut Execution,
    user: Option<String>,
    ignore_current_status: bool,
    now: DateTime<Utc>,
) -> Result<Change> {
    let status = execution.status;
    match status {
        ExecutionStatus::Paused => {}
        ExecutionStatus::Running | ExecutionStatus::NotStarted if ignore_current_status => {}
        ExecutionStatus::Running => return Ok(Change::unchanged()),
        _ => {
            return Err(Error::InvalidOperation {
                execution_id: execution.id.clone(),
                reason: format!("cannot resume an execution that is {}", status),
            })
        }
    }

    let paused_for = match (status, execution.paused.as_ref()) {
        (ExecutionStatus::Paused, Some(details)) => (now - details.pause_time).max(Duration::zero()),
        _ => Duration::zero(),
    };

    if status == ExecutionStatus::NotStarted {
        validate_graph(execution)?;
        validate_timings(execution, now)?;
        execution.start_time = Some(now);
    }
    execution.set_status(ExecutionStatus::Running)?;
    if let Some(details) = execution.paused.as_mut() {
        if details.resume_time.is_none() {
            details.resumed_by = user;
            details.resume_time = Some(now);
        }
    }

    let execution_id = execution.id.clone();
    let mut runs = Vec::new();
    for stage in &mut execution.stages {
        if stage.status == ExecutionStatus::Paused {
            stage.set_status(ExecutionStatus::Running)?;
            stage.paused_ms += paused_for.num_milliseconds();
        }
        if stage.status != ExecutionStatus::Running {
            continue;
        }
        for task in stage
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Running)
        {
            task.paused_ms += paused_for.num_milliseconds();
            let next = task
                .next_attempt_at
                .map(|at| at.checked_add_signed(paused_for).unwrap_or(at))
                .unwrap_or(now);
            task.next_attempt_at = Some(next);
            runs.push(TaskRun {
                execution_id: execution_id.clone(),
                stage_id: stage.id.clone(),
                task_id: task.id.clone(),
                not_before: next,
            });
        }
    }

    runs.extend(advance(execution, now)?);
    Ok(Change::changed(runs))
}

/// Re-run a completed stage and everything downstream of it
///
/// `expected_attempt` must match the stage's current attempt, so a replayed
/// restart request cannot restart the stage a second time.
pub fn restart_stage(
    execution: &mut Execution,
    stage_id: &str,
    expected_attempt: u32,
    now: DateTime<Utc>,
) -> Result<Change> {
    if execution.is_complete() {
        return Err(Error::InvalidOperation {
            execution_id: execution.id.clone(),
            reason: format!(
                "cannot restart a stage of an execution that is {}",
                execution.status
            ),
        });
    }

    let stage = execution.require_stage(stage_id)?;
    if stage.attempt != expected_attempt {
        return Err(Error::StaleEvent {
            execution_id: execution.id.clone(),
            reason: format!(
                "stage {} is on attempt {}, restart expected attempt {}",
                stage_id, stage.attempt, expected_attempt
            ),
        });
    }
    if !stage.status.is_complete() {
        return Err(Error::InvalidOperation {
            execution_id: execution.id.clone(),
            reason: format!(
                "stage {} is {}; only completed stages can be restarted",
                stage_id, stage.status
            ),
        });
    }

    let mut to_reset: HashSet<String> = HashSet::new();
    let mut queue = VecDeque::from([stage_id.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !to_reset.insert(id.clone()) {
            continue;
        }
        if let Some(stage) = execution.stage(&id) {
            queue.extend(stage.children.iter().cloned());
        }
    }

    for stage in execution
        .stages
        .iter_mut()
        .filter(|s| to_reset.contains(&s.id))
    {
        if stage.status != ExecutionStatus::NotStarted {
            stage.attempt += 1;
        }
        stage.status = ExecutionStatus::NotStarted;
        stage.start_time = None;
        stage.end_time = None;
        stage.paused_ms = 0;
        for task in &mut stage.tasks {
            task.status = TaskStatus::NotStarted;
            task.started_at = None;
            task.ended_at = None;
            task.next_attempt_at = None;
            task.attempts = 0;
            task.paused_ms = 0;
            task.error = None;
        }
    }

    Ok(Change::changed(advance(execution, now)?))
}

pub fn patch_stage(
    execution: &mut Execution,
    stage_id: &str,
    context: Map<String, JsonValue>,
) -> Result<Change> {
    let stage = execution.require_stage_mut(stage_id)?;
    let changed = context
        .iter()
        .any(|(key, value)| stage.context.get(key) != Some(value));
    if !changed {
        return Ok(Change::unchanged());
    }
    stage.context.extend(context);
    Ok(Change::changed(Vec::new()))
}
