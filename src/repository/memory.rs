use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ensure_owned, ExecutionRepository};
use crate::error::{Error, Result};
use crate::types::{Execution, ExecutionStatus};

/// In-process repository
///
/// Siblings made with [`InMemoryExecutionRepository::for_partition`] share the
/// same storage, which is how tests simulate several nodes in front of one
/// database.
#[derive(Clone, Default)]
pub struct InMemoryExecutionRepository {
    executions: Arc<RwLock<HashMap<String, Execution>>>,
    partition: Option<String>,
}

impl InMemoryExecutionRepository {
    pub fn new(partition: Option<String>) -> Self {
        Self {
            executions: Arc::default(),
            partition,
        }
    }

    /// A view over the same storage serving a different partition
    pub fn for_partition(&self, partition: Option<String>) -> Self {
        Self {
            executions: self.executions.clone(),
            partition,
        }
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    async fn load(&self, execution_id: &str) -> Result<Execution> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))
    }

    async fn save(&self, execution: &Execution) -> Result<()> {
        ensure_owned(self, execution)?;
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn delete(&self, execution_id: &str) -> Result<()> {
        match self.executions.write().await.remove(execution_id) {
            Some(_) => Ok(()),
            None => Err(Error::ExecutionNotFound(execution_id.to_string())),
        }
    }

    async fn running_executions(&self) -> Result<Vec<Execution>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.status == ExecutionStatus::Running && self.handles_partition(&e.partition))
            .cloned()
            .collect())
    }
}
