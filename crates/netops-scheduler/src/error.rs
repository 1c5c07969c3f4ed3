use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed definition: bad schedule, missing field, dependency cycle.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The schedule expression could not be parsed or evaluated.
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    NotFound { id: String },

    /// A manual run was requested before the job's prerequisites completed.
    #[error("Dependencies of {id} not satisfied: {}", .pending.join(", "))]
    DependencyUnsatisfied { id: String, pending: Vec<String> },

    /// The job already has an execution in flight.
    #[error("Job already running: {id}")]
    AlreadyRunning { id: String },

    /// A single attempt exceeded the job's timeout.
    #[error("timed out after {secs} seconds")]
    ExecutionTimeout { secs: u64 },

    /// The task reference returned an error or panicked.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// start/stop called in the wrong state.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

impl SchedulerError {
    /// Short error code string for CLI/API front ends.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::DependencyUnsatisfied { .. } => "DEPENDENCY_UNSATISFIED",
            SchedulerError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            SchedulerError::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            SchedulerError::Execution(_) => "EXECUTION_ERROR",
            SchedulerError::Storage(_) => "STORAGE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Io(_) => "IO_ERROR",
            SchedulerError::Lifecycle(_) => "LIFECYCLE_ERROR",
        }
    }

    pub(crate) fn not_found(id: &str) -> Self {
        SchedulerError::NotFound { id: id.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
