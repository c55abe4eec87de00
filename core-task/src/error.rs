use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by task pools and delivered through task results.
///
/// Cloneable so that one stored failure can be handed to every waiter.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The API was used in a way its contract forbids. Not retryable.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Task failed: {0}")]
    Execution(Arc<anyhow::Error>),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Pool '{pool}' rejected task: {reason}")]
    Rejected { pool: String, reason: String },

    #[error("No result after {0:?}")]
    Timeout(Duration),

    #[error("Task interrupted")]
    Interrupted,

    #[error("Task '{id}' was discarded before it ran")]
    Discarded { id: String },

    #[error("Result is not ready")]
    NotReady,

    #[error("A pool named '{0}' is already registered")]
    DuplicatePool(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TaskError {
    /// Recovers a `TaskError` carried inside an `anyhow::Error`, wrapping
    /// anything else as [`TaskError::Execution`].
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        match error.downcast::<TaskError>() {
            Ok(task_error) => task_error,
            Err(other) => TaskError::Execution(Arc::new(other)),
        }
    }

    /// Caller bugs: double completion, wrong thread, mismatched substitution.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, TaskError::IllegalState(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, TaskError::Rejected { .. })
    }
}

impl From<core_runtime::Error> for TaskError {
    fn from(error: core_runtime::Error) -> Self {
        match error {
            core_runtime::Error::Config(message) => TaskError::Config(message),
            other => TaskError::Config(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
