//! Error taxonomy for the coordination core
//!
//! Lock contention is not an error: `DistributedLock::acquire` returns `false`.
//! Task timeouts are not errors either; they are recorded on the task and turn
//! it TERMINAL. Everything else that a caller may need to react to lives here.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The retriable lock wrapper exhausted its attempts.
    #[error("failed to acquire lock '{name}' after {attempts} attempt(s)")]
    FailedToAcquireLock { name: String, attempts: u32 },

    /// The lock or execution backing store could not be reached.
    #[error("backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("stage {stage_id} not found in execution {execution_id}")]
    StageNotFound {
        execution_id: String,
        stage_id: String,
    },

    #[error("task {task_id} not found in stage {stage_id}")]
    TaskNotFound { stage_id: String, task_id: String },

    /// The execution belongs to a partition this node does not serve.
    #[error("execution {execution_id} belongs to partition '{partition}' (this node serves {served})")]
    ForeignExecution {
        execution_id: String,
        partition: String,
        served: String,
    },

    #[error("cannot move {entity} {id} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("invalid operation on execution {execution_id}: {reason}")]
    InvalidOperation {
        execution_id: String,
        reason: String,
    },

    #[error("invalid stage graph for execution {execution_id}: {reason}")]
    InvalidGraph {
        execution_id: String,
        reason: String,
    },

    /// An interlink event's embedded expectation no longer matches current state.
    #[error("stale event for execution {execution_id}: {reason}")]
    StaleEvent {
        execution_id: String,
        reason: String,
    },

    #[error("malformed interlink event: {0}")]
    MalformedEvent(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for failures that a later redelivery of the same work may get past.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::FailedToAcquireLock { .. } | Error::StoreUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Error::StoreUnavailable(err.to_string()),
            other => Error::Repository(other.to_string()),
        }
    }
}
