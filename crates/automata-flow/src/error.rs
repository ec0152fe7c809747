//! Error types for the execution-coordination domain.

use automata_core::{RunId, TaskId};

/// The result type used throughout automata-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coordination operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A flow spec failed validation.
    #[error("invalid flow spec: step {step_id:?} field {field:?}: {message}")]
    Validation {
        /// The offending step id (empty when the spec as a whole is invalid).
        step_id: String,
        /// The offending field.
        field: String,
        /// Description of the violation.
        message: String,
    },

    /// A cycle was detected in the dependency graph.
    #[error("cyclic dependency detected: {cycle:?}")]
    CycleDetected {
        /// A node on the cycle, for diagnostics.
        cycle: Vec<String>,
    },

    /// A run was not found.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: RunId,
    },

    /// A task was not found.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// A run is not in the PENDING state required to start driving it.
    #[error("run is not pending")]
    RunNotPending,

    /// A run is already registered in the orchestrator's active set.
    #[error("run is already active")]
    RunAlreadyActive,

    /// A task is not in the QUEUED state required to execute it.
    #[error("task is not queued")]
    TaskNotQueued,

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A run with the same `(flow_id, idempotency_key)` already exists.
    #[error("duplicate idempotency key: {key}")]
    DuplicateIdempotencyKey {
        /// The conflicting key.
        key: String,
    },

    /// A task for the same `(run_id, step_id)` already exists.
    #[error("duplicate task for run {run_id} step {step_id}")]
    DuplicateTask {
        /// The run owning the step.
        run_id: RunId,
        /// The step that already has a task.
        step_id: String,
    },

    /// No executor is registered for a step type.
    #[error("unknown step type: {step_type}")]
    UnknownStepType {
        /// The unrecognized type.
        step_type: String,
    },

    /// A template failed to parse.
    #[error("template parse error: {message}")]
    TemplateParse {
        /// Description of the parse failure.
        message: String,
    },

    /// A template failed to render.
    #[error("template render error: {message}")]
    TemplateRender {
        /// Description of the render failure.
        message: String,
    },

    /// A schedule is malformed (bad cron expression, no recurrence).
    #[error("invalid schedule: {message}")]
    InvalidSchedule {
        /// Description of the problem.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A broker operation failed.
    #[error("broker error: {message}")]
    Broker {
        /// Description of the broker failure.
        message: String,
    },

    /// Task execution hit an infrastructure failure (network, timeout).
    #[error("execution error: {message}")]
    Execution {
        /// Description of the failure.
        message: String,
    },

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// A serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An error from automata-core.
    #[error("core error: {0}")]
    Core(#[from] automata_core::Error),
}

impl Error {
    /// Creates a validation error for a specific step and field.
    #[must_use]
    pub fn validation(
        step_id: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            step_id: step_id.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new broker error.
    #[must_use]
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Creates a new execution (infrastructure) error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_step_and_field() {
        let err = Error::validation("fetch", "depends_on", "depends on unknown step: missing");
        let msg = err.to_string();
        assert!(msg.contains("fetch"));
        assert!(msg.contains("depends_on"));
        assert!(msg.contains("missing"));
    }

    #[test]
    fn cycle_error_display() {
        let err = Error::CycleDetected {
            cycle: vec!["a".into()],
        };
        assert!(err.to_string().contains("cyclic dependency"));
    }

    #[test]
    fn storage_error_with_source() {
        use std::error::Error as StdError;

        let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::storage_with_source("failed to reach store", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
