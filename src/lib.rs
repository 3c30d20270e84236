pub mod application;
pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod interlink;
pub mod lock;
pub mod repository;
pub mod types;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use types::*;

pub use application::{initialize, Application, InitBuilder, InitOptions};
pub use engine::{ControlOutcome, Engine, TaskHandler, TaskRegistry, TaskResult};
pub use error::{Error, Result};
pub use lock::{DistributedLock, NotificationClusterLock, RetriableLock};
