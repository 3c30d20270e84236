//! Partitioned execution storage
//!
//! Every node reads any execution but only persists those in the partition
//! it serves. A node with no partition configured serves all of them.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::Execution;

pub use memory::InMemoryExecutionRepository;
pub use postgres::PgExecutionRepository;

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Partition served by this node, `None` meaning every partition
    fn partition(&self) -> Option<&str>;

    fn handles_partition(&self, partition: &str) -> bool {
        match self.partition() {
            None => true,
            Some(served) => served == partition,
        }
    }

    async fn load(&self, execution_id: &str) -> Result<Execution>;

    /// Insert or replace; rejects executions owned by another partition
    async fn save(&self, execution: &Execution) -> Result<()>;

    async fn delete(&self, execution_id: &str) -> Result<()>;

    /// RUNNING executions in the served partition, for recovery after restarts
    async fn running_executions(&self) -> Result<Vec<Execution>>;
}

pub(crate) fn ensure_owned(repository: &dyn ExecutionRepository, execution: &Execution) -> Result<()> {
    if repository.handles_partition(&execution.partition) {
        Ok(())
    } else {
        Err(Error::ForeignExecution {
            execution_id: execution.id.clone(),
            partition: execution.partition.clone(),
            served: repository.partition().unwrap_or("*").to_string(),
        })
    }
}
