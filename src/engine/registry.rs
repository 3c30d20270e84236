use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::types::ExecutionType;

/// What a unit of work reports back to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Terminal,
    /// Not done yet; invoke again after the task's backoff period
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub outcome: TaskOutcome,
    /// Merged into the stage context for later tasks to read
    pub outputs: Map<String, JsonValue>,
    pub error: Option<String>,
}

impl TaskResult {
    fn new(outcome: TaskOutcome) -> Self {
        Self {
            outcome,
            outputs: Map::new(),
            error: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::new(TaskOutcome::Succeeded)
    }

    pub fn running() -> Self {
        Self::new(TaskOutcome::Running)
    }

    pub fn terminal(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(TaskOutcome::Terminal)
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }
}

/// Everything a task handler may know about the invocation
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: String,
    pub execution_type: ExecutionType,
    pub application: String,
    pub stage_id: String,
    pub stage_type: String,
    pub task_id: String,
    /// Invocations already applied for this task
    pub attempts: u32,
    pub stage_context: Map<String, JsonValue>,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, context: TaskContext) -> anyhow::Result<TaskResult>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskResult>> + Send,
{
    async fn execute(&self, context: TaskContext) -> anyhow::Result<TaskResult> {
        (self.0)(context).await
    }
}

/// Maps capability ids to task implementations; filled once at startup
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(id.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, id: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TaskResult>> + Send + 'static,
    {
        self.register(id, Arc::new(FnHandler(f)))
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
