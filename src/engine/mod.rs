//! Stage/task execution engine
//!
//! Every mutation of an execution happens in one batch under the execution's
//! retriable lock: load, apply a pure transition from [`state`], save. Task
//! handlers run outside the lock and their results are applied in a second
//! batch. Control operations for executions owned by another partition are
//! forwarded over the interlink instead of being applied here.

pub mod registry;
pub mod scheduler;
pub mod state;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::interlink::{Fingerprinter, InterlinkEvent, InterlinkEventKind, InterlinkTransport};
use crate::lock::{Backoff, LockOptions, RetriableLock};
use crate::repository::{ensure_owned, ExecutionRepository};
use crate::types::{Execution, ExecutionStatus, Stage, Task, TaskStatus};

pub use registry::{TaskContext, TaskHandler, TaskOutcome, TaskRegistry, TaskResult};
pub use scheduler::Scheduler;
pub use state::{Change, TaskRun};

use state::Invocation;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lock_ttl: Duration,
    pub lock_max_retries: u32,
    pub lock_backoff: Backoff,
    pub lock_heartbeat: Option<Duration>,
    pub lock_max_duration: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_ttl: config.locks.ttl(),
            lock_max_retries: config.engine.lock_max_retries,
            lock_backoff: Backoff::Exponential {
                initial: Duration::from_millis(config.engine.lock_backoff_ms),
                max: Duration::from_millis(config.engine.lock_backoff_max_ms),
            },
            lock_heartbeat: config.locks.heartbeat(),
            lock_max_duration: config.locks.max_duration(),
        }
    }
}

/// What a control operation did
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    /// Applied locally; the runs were handed to the scheduler
    Applied(Vec<TaskRun>),
    /// Already in the requested state
    Unchanged,
    /// Published for the owning partition to apply
    Forwarded { fingerprint: String },
}

impl From<Change> for ControlOutcome {
    fn from(change: Change) -> Self {
        if change.changed {
            ControlOutcome::Applied(change.runs)
        } else {
            ControlOutcome::Unchanged
        }
    }
}

struct Interlink {
    transport: Arc<dyn InterlinkTransport>,
    fingerprinter: Arc<dyn Fingerprinter>,
}

pub struct EngineBuilder {
    repository: Arc<dyn ExecutionRepository>,
    lock: RetriableLock,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    interlink: Option<Interlink>,
    settings: EngineSettings,
    run_sink: Option<mpsc::UnboundedSender<TaskRun>>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Forward control operations for foreign executions over this transport
    pub fn interlink(
        mut self,
        transport: Arc<dyn InterlinkTransport>,
        fingerprinter: Arc<dyn Fingerprinter>,
    ) -> Self {
        self.interlink = Some(Interlink {
            transport,
            fingerprinter,
        });
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Where produced task runs are sent, normally the scheduler's inbox
    pub fn run_sink(mut self, sink: mpsc::UnboundedSender<TaskRun>) -> Self {
        self.run_sink = Some(sink);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            repository: self.repository,
            lock: self.lock,
            registry: self.registry,
            clock: self.clock,
            interlink: self.interlink,
            settings: self.settings,
            run_sink: self.run_sink,
            in_flight: Mutex::new(HashSet::new()),
        }
    }
}

pub struct Engine {
    repository: Arc<dyn ExecutionRepository>,
    lock: RetriableLock,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    interlink: Option<Interlink>,
    settings: EngineSettings,
    run_sink: Option<mpsc::UnboundedSender<TaskRun>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Engine {
    pub fn builder(
        repository: Arc<dyn ExecutionRepository>,
        lock: RetriableLock,
        registry: Arc<TaskRegistry>,
    ) -> EngineBuilder {
        EngineBuilder {
            repository,
            lock,
            registry,
            clock: Arc::new(SystemClock),
            interlink: None,
            settings: EngineSettings::default(),
            run_sink: None,
        }
    }

    pub fn lock_name(execution_id: &str) -> String {
        format!("execution:{}", execution_id)
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn interlink_enabled(&self) -> bool {
        self.interlink.is_some()
    }

    /// Start a NOT_STARTED execution owned by this node
    pub async fn start(&self, execution_id: &str) -> Result<ControlOutcome> {
        let execution = self.repository.load(execution_id).await?;
        ensure_owned(self.repository.as_ref(), &execution)?;

        let change = self.mutate(execution_id, state::start).await?;
        if change.changed {
            info!(execution_id, runs = change.runs.len(), "Execution started");
        }
        Ok(change.into())
    }

    pub async fn cancel(
        &self,
        execution_id: &str,
        user: Option<String>,
        reason: Option<String>,
    ) -> Result<ControlOutcome> {
        let execution = self.repository.load(execution_id).await?;
        self.control(&execution, InterlinkEventKind::Cancel { user, reason })
            .await
    }

    pub async fn pause(&self, execution_id: &str, user: Option<String>) -> Result<ControlOutcome> {
        let execution = self.repository.load(execution_id).await?;
        self.control(&execution, InterlinkEventKind::Pause { user })
            .await
    }

    pub async fn resume(
        &self,
        execution_id: &str,
        user: Option<String>,
        ignore_current_status: bool,
    ) -> Result<ControlOutcome> {
        let execution = self.repository.load(execution_id).await?;
        self.control(
            &execution,
            InterlinkEventKind::Resume {
                user,
                ignore_current_status,
            },
        )
        .await
    }

    /// Restart a completed stage, pinned to the attempt visible right now
    pub async fn restart_stage(&self, execution_id: &str, stage_id: &str) -> Result<ControlOutcome> {
        let execution = self.repository.load(execution_id).await?;
        let expected_attempt = execution.require_stage(stage_id)?.attempt;
        self.control(
            &execution,
            InterlinkEventKind::RestartStage {
                stage_id: stage_id.to_string(),
                expected_attempt,
            },
        )
        .await
    }

    pub async fn patch_stage(
        &self,
        execution_id: &str,
        stage_id: &str,
        context: Map<String, JsonValue>,
    ) -> Result<ControlOutcome> {
        let execution = self.repository.load(execution_id).await?;
        execution.require_stage(stage_id)?;
        self.control(
            &execution,
            InterlinkEventKind::PatchStage {
                stage_id: stage_id.to_string(),
                context,
            },
        )
        .await
    }

    pub async fn delete(&self, execution_id: &str) -> Result<ControlOutcome> {
        let execution = self.repository.load(execution_id).await?;
        self.control(&execution, InterlinkEventKind::Delete).await
    }

    /// Apply an event received over the interlink; the execution must be owned here
    pub async fn apply_event(&self, event: &InterlinkEvent) -> Result<ControlOutcome> {
        self.apply_kind(&event.execution_id, event.kind.clone())
            .await
    }

    /// Invoke one task and apply what it reported
    ///
    /// Returns the follow-up runs, which are also sent to the run sink. Runs
    /// for tasks that are no longer RUNNING (canceled, paused, restarted,
    /// deleted, or owned elsewhere) are dropped.
    pub async fn run_task(&self, run: &TaskRun) -> Result<Vec<TaskRun>> {
        let execution = match self.repository.load(&run.execution_id).await {
            Ok(execution) => execution,
            Err(Error::ExecutionNotFound(_)) => {
                debug!(execution_id = %run.execution_id, "Execution no longer exists; dropping run");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        if !self.repository.handles_partition(&execution.partition) {
            debug!(execution_id = %run.execution_id, partition = %execution.partition, "Not the owner; dropping run");
            return Ok(Vec::new());
        }

        let Some(snapshot) = state::runnable(&execution, &run.stage_id, &run.task_id) else {
            debug!(
                execution_id = %run.execution_id,
                stage_id = %run.stage_id,
                task_id = %run.task_id,
                status = %execution.status,
                "Task is not runnable; dropping run"
            );
            return Ok(Vec::new());
        };
        let stage = execution.require_stage(&run.stage_id)?;
        let task = stage.task(&run.task_id).ok_or_else(|| Error::TaskNotFound {
            stage_id: run.stage_id.clone(),
            task_id: run.task_id.clone(),
        })?;

        let now = self.clock.now();
        if let Some(next_attempt_at) = task.next_attempt_at {
            if now < next_attempt_at {
                let requeued = run.at(next_attempt_at);
                self.dispatch(std::slice::from_ref(&requeued));
                return Ok(vec![requeued]);
            }
        }

        let invocation = if stage.has_timed_out(now) {
            warn!(
                execution_id = %run.execution_id,
                stage_id = %run.stage_id,
                timeout_ms = stage.timeout_ms,
                "Stage exceeded its timeout"
            );
            Invocation::StageTimedOut {
                elapsed: stage.elapsed(now),
            }
        } else if task.has_timed_out(now) {
            warn!(
                execution_id = %run.execution_id,
                task_id = %run.task_id,
                timeout_ms = task.timeout_ms,
                "Task exceeded its timeout"
            );
            Invocation::TimedOut {
                elapsed: task.elapsed(now),
            }
        } else {
            self.invoke(&execution, stage, task, now).await
        };

        let stage_id = run.stage_id.clone();
        let task_id = run.task_id.clone();
        let change = self
            .mutate(&run.execution_id, move |execution, now| {
                state::apply_invocation(execution, &stage_id, &task_id, snapshot, invocation, now)
            })
            .await?;

        if !change.changed {
            debug!(execution_id = %run.execution_id, task_id = %run.task_id, "Stale task result dropped");
        }
        Ok(change.runs)
    }

    /// Re-issue runs for every RUNNING task in the served partition
    pub async fn recover(&self) -> Result<Vec<TaskRun>> {
        let runs = self.running_task_runs().await?;
        if !runs.is_empty() {
            info!(runs = runs.len(), "Recovered running tasks");
        }
        self.dispatch(&runs);
        Ok(runs)
    }

    /// One run per RUNNING task in the served partition, due at its next attempt
    pub async fn running_task_runs(&self) -> Result<Vec<TaskRun>> {
        let now = self.clock.now();
        let executions = self.repository.running_executions().await?;

        Ok(executions
            .iter()
            .flat_map(|execution| {
                execution
                    .stages
                    .iter()
                    .filter(|stage| stage.status == ExecutionStatus::Running)
                    .flat_map(move |stage| {
                        stage
                            .tasks
                            .iter()
                            .filter(|task| task.status == TaskStatus::Running)
                            .map(move |task| TaskRun {
                                execution_id: execution.id.clone(),
                                stage_id: stage.id.clone(),
                                task_id: task.id.clone(),
                                not_before: task.next_attempt_at.unwrap_or(now),
                            })
                    })
            })
            .collect())
    }

    async fn control(&self, execution: &Execution, kind: InterlinkEventKind) -> Result<ControlOutcome> {
        if self.repository.handles_partition(&execution.partition) {
            self.apply_kind(&execution.id, kind).await
        } else {
            self.forward(execution, kind).await
        }
    }

    async fn forward(&self, execution: &Execution, kind: InterlinkEventKind) -> Result<ControlOutcome> {
        let Some(interlink) = &self.interlink else {
            return Err(Error::ForeignExecution {
                execution_id: execution.id.clone(),
                partition: execution.partition.clone(),
                served: self.repository.partition().unwrap_or("*").to_string(),
            });
        };

        let event = InterlinkEvent::new(
            kind,
            execution.execution_type,
            execution.id.clone(),
            self.clock.now(),
        )
        .with_partition(execution.partition.clone())
        .fingerprinted(interlink.fingerprinter.as_ref());

        interlink.transport.publish(&event).await?;
        info!(
            execution_id = %execution.id,
            partition = %execution.partition,
            kind = event.kind.tag(),
            fingerprint = %event.fingerprint,
            "Forwarded control event to owning partition"
        );
        Ok(ControlOutcome::Forwarded {
            fingerprint: event.fingerprint,
        })
    }

    async fn apply_kind(&self, execution_id: &str, kind: InterlinkEventKind) -> Result<ControlOutcome> {
        let tag = kind.tag();
        let change = match kind {
            InterlinkEventKind::Cancel { user, reason } => {
                self.mutate(execution_id, move |execution, now| {
                    state::cancel(execution, user, reason, now)
                })
                .await?
            }
            InterlinkEventKind::Pause { user } => {
                self.mutate(execution_id, move |execution, now| {
                    state::pause(execution, user, now)
                })
                .await?
            }
            InterlinkEventKind::Resume {
                user,
                ignore_current_status,
            } => {
                self.mutate(execution_id, move |execution, now| {
                    state::resume(execution, user, ignore_current_status, now)
                })
                .await?
            }
            InterlinkEventKind::RestartStage {
                stage_id,
                expected_attempt,
            } => {
                self.mutate(execution_id, move |execution, now| {
                    state::restart_stage(execution, &stage_id, expected_attempt, now)
                })
                .await?
            }
            InterlinkEventKind::PatchStage { stage_id, context } => {
                self.mutate(execution_id, move |execution, _now| {
                    state::patch_stage(execution, &stage_id, context)
                })
                .await?
            }
            InterlinkEventKind::Delete => return self.delete_owned(execution_id).await,
        };

        if change.changed {
            info!(execution_id, kind = tag, "Control operation applied");
        } else {
            debug!(execution_id, kind = tag, "Control operation was a no-op");
        }
        Ok(change.into())
    }

    async fn delete_owned(&self, execution_id: &str) -> Result<ControlOutcome> {
        let _guard = self.enter(execution_id).await?;
        let options = self.lock_options(execution_id);
        let repository = &self.repository;

        let deleted = self
            .lock
            .run_under_lock(&options, move || async move {
                let execution = match repository.load(execution_id).await {
                    Ok(execution) => execution,
                    Err(Error::ExecutionNotFound(_)) => return Ok(false),
                    Err(e) => return Err(e),
                };
                ensure_owned(repository.as_ref(), &execution)?;
                repository.delete(execution_id).await?;
                Ok(true)
            })
            .await?;

        if deleted {
            info!(execution_id, "Execution deleted");
            Ok(ControlOutcome::Applied(Vec::new()))
        } else {
            Ok(ControlOutcome::Unchanged)
        }
    }

    /// Run one transition batch under the execution's lock
    async fn mutate<F>(&self, execution_id: &str, transition: F) -> Result<Change>
    where
        F: FnOnce(&mut Execution, DateTime<Utc>) -> Result<Change> + Send,
    {
        let _guard = self.enter(execution_id).await?;
        let options = self.lock_options(execution_id);
        let repository = &self.repository;
        let clock = &self.clock;

        let change = self
            .lock
            .run_under_lock(&options, move || async move {
                let mut execution = repository.load(execution_id).await?;
                ensure_owned(repository.as_ref(), &execution)?;

                let change = transition(&mut execution, clock.now())?;
                if change.changed {
                    repository.save(&execution).await?;
                }
                Ok(change)
            })
            .await?;

        self.dispatch(&change.runs);
        Ok(change)
    }

    async fn invoke(&self, execution: &Execution, stage: &Stage, task: &Task, now: DateTime<Utc>) -> Invocation {
        let Some(handler) = self.registry.get(&task.implementation) else {
            warn!(
                execution_id = %execution.id,
                task_id = %task.id,
                implementation = %task.implementation,
                "No task handler registered"
            );
            return Invocation::Failed {
                error: format!("no task handler registered for '{}'", task.implementation),
                retry: false,
            };
        };

        let context = TaskContext {
            execution_id: execution.id.clone(),
            execution_type: execution.execution_type,
            application: execution.application.clone(),
            stage_id: stage.id.clone(),
            stage_type: stage.stage_type.clone(),
            task_id: task.id.clone(),
            attempts: task.attempts,
            stage_context: stage.context.clone(),
        };

        let task_remaining = task.timeout().checked_sub(&task.elapsed(now));
        let stage_remaining = stage
            .timeout()
            .and_then(|timeout| timeout.checked_sub(&stage.elapsed(now)));
        let remaining = task_remaining
            .into_iter()
            .chain(stage_remaining)
            .min()
            .and_then(|remaining| remaining.to_std().ok())
            .unwrap_or(Duration::ZERO);

        debug!(execution_id = %execution.id, task_id = %task.id, attempts = task.attempts, "Invoking task");
        match tokio::time::timeout(remaining, handler.execute(context)).await {
            Ok(Ok(result)) => Invocation::Reported(result),
            Ok(Err(e)) => {
                warn!(
                    execution_id = %execution.id,
                    task_id = %task.id,
                    retryable = task.retryable,
                    error = %format!("{:#}", e),
                    "Task handler failed"
                );
                Invocation::Failed {
                    error: format!("{:#}", e),
                    retry: task.retryable,
                }
            }
            Err(_) => {
                let now = self.clock.now();
                let stage_expired = stage
                    .timeout()
                    .is_some_and(|timeout| stage.elapsed(now) >= timeout);
                if stage_expired {
                    Invocation::StageTimedOut {
                        elapsed: stage.elapsed(now),
                    }
                } else {
                    Invocation::TimedOut {
                        elapsed: task.elapsed(now),
                    }
                }
            }
        }
    }

    fn lock_options(&self, execution_id: &str) -> LockOptions {
        LockOptions::new(Self::lock_name(execution_id), self.settings.lock_ttl)
            .max_retries(self.settings.lock_max_retries)
            .backoff(self.settings.lock_backoff)
            .heartbeat(self.settings.lock_heartbeat)
            .max_duration(self.settings.lock_max_duration)
    }

    /// Claim the in-process slot for an execution before touching the
    /// distributed lock
    async fn enter(&self, execution_id: &str) -> Result<InFlightGuard<'_>> {
        let attempts = self.settings.lock_max_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let inserted = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(execution_id.to_string());
            if inserted {
                return Ok(InFlightGuard {
                    set: &self.in_flight,
                    execution_id: execution_id.to_string(),
                });
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.lock_backoff.delay(attempt)).await;
            }
        }

        Err(Error::FailedToAcquireLock {
            name: Self::lock_name(execution_id),
            attempts,
        })
    }

    fn dispatch(&self, runs: &[TaskRun]) {
        let Some(sink) = &self.run_sink else {
            return;
        };
        for run in runs {
            if sink.send(run.clone()).is_err() {
                debug!(execution_id = %run.execution_id, "Scheduler is gone; run not queued");
            }
        }
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    execution_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.execution_id);
    }
}
