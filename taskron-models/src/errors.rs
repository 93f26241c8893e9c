use std::{fmt, time::Duration};

use thiserror::Error;

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub struct RuntimeError {
    code: String,
    message: String,
}

impl RuntimeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Errors surfaced by the task store, the schedule engine and the scheduler.
#[derive(Debug, Error)]
pub enum TaskronError {
    #[error("invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("log entry {0} not found")]
    LogNotFound(i64),

    #[error("execution timed out after {}s", .timeout.as_secs_f64())]
    ExecutionTimeout { timeout: Duration },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("task {0} is already running")]
    ConcurrentRunRejected(i64),

    #[error("task store error: {0}")]
    StoreIo(#[source] SendableError),
}

impl TaskronError {
    pub fn invalid_schedule(expression: &str, reason: impl Into<String>) -> Self {
        TaskronError::InvalidSchedule {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TaskronError::InvalidSchedule { .. } => "invalid_schedule",
            TaskronError::InvalidTask(_) => "invalid_task",
            TaskronError::TaskNotFound(_) => "task_not_found",
            TaskronError::LogNotFound(_) => "log_not_found",
            TaskronError::ExecutionTimeout { .. } => "execution_timeout",
            TaskronError::ExecutionFailed(_) => "execution_failed",
            TaskronError::ConcurrentRunRejected(_) => "concurrent_run_rejected",
            TaskronError::StoreIo(_) => "store_io",
        }
    }
}
