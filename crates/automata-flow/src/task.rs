//! Task state and lifecycle: the attempt group for one step inside a run.
//!
//! Status transitions follow a small lattice:
//!
//! ```text
//! QUEUED ──> RUNNING ──> SUCCEEDED
//!    ▲          │
//!    │          ▼
//!    └────── FAILED   (reset_for_retry, while attempts remain)
//! ```
//!
//! The attempt counter is incremented by [`Task::mark_running`], so the
//! first execution observes attempt 1 and the counter survives
//! [`Task::reset_for_retry`] unchanged.

use automata_core::{RunId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::spec::StepType;

/// The state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Persisted, waiting for a worker.
    Queued,
    /// A worker is executing an attempt.
    Running,
    /// The step completed successfully.
    Succeeded,
    /// The step failed (terminal unless reset for retry).
    Failed,
}

impl TaskStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// FAILED -> QUEUED is the retry edge, taken only through
    /// [`Task::reset_for_retry`].
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Queued => matches!(target, Self::Running),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed),
            Self::Failed => matches!(target, Self::Queued),
            Self::Succeeded => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// One unit of dispatched work: a step execution within a run.
///
/// At most one task exists per `(run_id, step_id)`; retries reuse the row,
/// bumping `attempt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// The owning run.
    pub run_id: RunId,
    /// The DAG node id this task executes.
    pub step_id: String,
    /// Human-readable step name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// The step type, which selects the executor.
    pub step_type: StepType,
    /// Attempt number; 0 until the first `mark_running`.
    pub attempt: u32,
    /// Current status.
    pub status: TaskStatus,
    /// Rendered step configuration handed to the executor.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Execution outputs, set on success.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Error text, set on failure.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// When the current attempt started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// When the task row was created.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a QUEUED task for a step.
    #[must_use]
    pub fn new(
        run_id: RunId,
        step_id: impl Into<String>,
        name: impl Into<String>,
        step_type: StepType,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            run_id,
            step_id: step_id.into(),
            name: name.into(),
            step_type,
            attempt: 0,
            status: TaskStatus::Queued,
            payload,
            outputs: Map::new(),
            error: String::new(),
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    /// Returns true if the task is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the duration of the last attempt, or None while open.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Moves the task to RUNNING and increments the attempt counter.
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.attempt += 1;
    }

    /// Moves the task to SUCCEEDED with its outputs.
    pub fn mark_succeeded(&mut self, outputs: Map<String, Value>) {
        self.status = TaskStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.outputs = outputs;
    }

    /// Moves the task to FAILED with an error message.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = error.into();
    }

    /// Prepares the task for another attempt: back to QUEUED with cleared
    /// timestamps and error. The attempt counter carries over; the next
    /// `mark_running` bumps it.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Queued;
        self.started_at = None;
        self.finished_at = None;
        self.error = String::new();
    }

    /// Returns true while another attempt is allowed under `max_attempts`.
    #[must_use]
    pub const fn can_retry(&self, max_attempts: u32) -> bool {
        self.attempt < max_attempts
    }
}
