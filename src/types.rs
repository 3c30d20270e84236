use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    Pipeline,
    Orchestration,
}

/// Status shared by executions and stages (SKIPPED is only ever used by stages)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    NotStarted,
    Running,
    Paused,
    Succeeded,
    FailedContinue,
    Terminal,
    Canceled,
    Skipped,
}

impl ExecutionStatus {
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::FailedContinue
                | ExecutionStatus::Terminal
                | ExecutionStatus::Canceled
                | ExecutionStatus::Skipped
        )
    }

    /// Whether a stage in this status lets its downstream stages start
    pub fn allows_downstream(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::FailedContinue | ExecutionStatus::Skipped
        )
    }

    fn execution_transition_allowed(self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (NotStarted, Running)
                | (NotStarted, Canceled)
                | (Running, Paused)
                | (Running, Succeeded)
                | (Running, FailedContinue)
                | (Running, Terminal)
                | (Running, Canceled)
                | (Paused, Running)
                | (Paused, Canceled)
        )
    }

    fn stage_transition_allowed(self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (NotStarted, Running)
                | (NotStarted, Skipped)
                | (NotStarted, Canceled)
                | (Running, Succeeded)
                | (Running, FailedContinue)
                | (Running, Terminal)
                | (Running, Canceled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Canceled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::NotStarted => "NOT_STARTED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::FailedContinue => "FAILED_CONTINUE",
            ExecutionStatus::Terminal => "TERMINAL",
            ExecutionStatus::Canceled => "CANCELED",
            ExecutionStatus::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotStarted,
    Running,
    Succeeded,
    Terminal,
    Canceled,
}

impl TaskStatus {
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Terminal | TaskStatus::Canceled
        )
    }

    fn transition_allowed(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (NotStarted, Running)
                | (NotStarted, Canceled)
                | (Running, Succeeded)
                | (Running, Terminal)
                | (Running, Canceled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::NotStarted => "NOT_STARTED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Terminal => "TERMINAL",
            TaskStatus::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PausedDetails {
    pub paused_by: Option<String>,
    pub pause_time: DateTime<Utc>,
    pub resumed_by: Option<String>,
    pub resume_time: Option<DateTime<Utc>>,
}

/// One run of a pipeline or orchestration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: String,
    #[serde(rename = "type")]
    pub execution_type: ExecutionType,
    pub application: String,
    pub partition: String,
    pub status: ExecutionStatus,
    pub stages: Vec<Stage>,

    #[serde(default)]
    pub canceled: bool,
    pub canceled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    pub paused: Option<PausedDetails>,

    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        execution_type: ExecutionType,
        application: impl Into<String>,
        partition: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_type,
            application: application.into(),
            partition: partition.into(),
            status: ExecutionStatus::NotStarted,
            stages: Vec::new(),
            canceled: false,
            canceled_by: None,
            cancellation_reason: None,
            paused: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        for stage in &mut self.stages {
            stage.execution_id = self.id.clone();
        }
        self
    }

    pub fn with_stage(mut self, mut stage: Stage) -> Self {
        stage.execution_id = self.id.clone();
        self.stages.push(stage);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_complete()
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }

    pub fn require_stage(&self, stage_id: &str) -> Result<&Stage> {
        self.stage(stage_id).ok_or_else(|| Error::StageNotFound {
            execution_id: self.id.clone(),
            stage_id: stage_id.to_string(),
        })
    }

    pub fn require_stage_mut(&mut self, stage_id: &str) -> Result<&mut Stage> {
        let execution_id = self.id.clone();
        self.stage_mut(stage_id).ok_or_else(|| Error::StageNotFound {
            execution_id,
            stage_id: stage_id.to_string(),
        })
    }

    /// Ids of the stages listing `stage_id` as a child
    pub fn parent_ids(&self, stage_id: &str) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.children.iter().any(|c| c == stage_id))
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn set_status(&mut self, to: ExecutionStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if to == ExecutionStatus::Skipped || !self.status.execution_transition_allowed(to) {
            return Err(Error::InvalidTransition {
                entity: "execution",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// One vertex of an execution's stage graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    pub id: String,
    pub execution_id: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub context: Map<String, JsonValue>,
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    /// Bound on the stage's running time across all of its tasks
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub paused_ms: i64,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

fn first_attempt() -> u32 {
    1
}

/// Millisecond count as a chrono duration, saturating instead of wrapping
pub(crate) fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

fn as_millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Stage {
    pub fn new(id: impl Into<String>, stage_type: impl Into<String>) -> Self {
        let stage_type = stage_type.into();
        Self {
            id: id.into(),
            execution_id: String::new(),
            name: stage_type.clone(),
            stage_type,
            children: Vec::new(),
            status: ExecutionStatus::NotStarted,
            context: Map::new(),
            tasks: Vec::new(),
            continue_on_failure: false,
            enabled: true,
            attempt: first_attempt(),
            timeout_ms: None,
            paused_ms: 0,
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_task(mut self, mut task: Task) -> Self {
        task.stage_id = self.id.clone();
        self.tasks.push(task);
        self
    }

    pub fn with_child(mut self, child_id: impl Into<String>) -> Self {
        self.children.push(child_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_ms = Some(as_millis(timeout));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(millis)
    }

    /// Running time since the stage started, excluding time spent paused
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        match self.start_time {
            Some(start_time) => now - start_time - Duration::milliseconds(self.paused_ms),
            None => Duration::zero(),
        }
    }

    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout()
            .is_some_and(|timeout| self.elapsed(now) > timeout)
    }

    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn require_task_mut(&mut self, task_id: &str) -> Result<&mut Task> {
        let stage_id = self.id.clone();
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| Error::TaskNotFound {
                stage_id,
                task_id: task_id.to_string(),
            })
    }

    pub fn set_status(&mut self, to: ExecutionStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.stage_transition_allowed(to) {
            return Err(Error::InvalidTransition {
                entity: "stage",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// One retryable unit of work inside a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub stage_id: String,
    pub name: String,
    /// Capability id resolved through the task registry
    pub implementation: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub retryable: bool,
    pub backoff_period_ms: u64,
    pub timeout_ms: u64,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub paused_ms: i64,
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        implementation: impl Into<String>,
        backoff_period: std::time::Duration,
        timeout: std::time::Duration,
    ) -> Self {
        let implementation = implementation.into();
        Self {
            id: id.into(),
            stage_id: String::new(),
            name: implementation.clone(),
            implementation,
            status: TaskStatus::NotStarted,
            retryable: true,
            backoff_period_ms: as_millis(backoff_period),
            timeout_ms: as_millis(timeout),
            started_at: None,
            ended_at: None,
            next_attempt_at: None,
            attempts: 0,
            paused_ms: 0,
            error: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn backoff_period(&self) -> Duration {
        millis(self.backoff_period_ms)
    }

    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }

    /// Running time since the first attempt, excluding time spent paused
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        match self.started_at {
            Some(started_at) => now - started_at - Duration::milliseconds(self.paused_ms),
            None => Duration::zero(),
        }
    }

    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.elapsed(now) > self.timeout()
    }

    pub fn set_status(&mut self, to: TaskStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.transition_allowed(to) {
            return Err(Error::InvalidTransition {
                entity: "task",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}
