//! Run tracking: one execution of a specific flow version.

use automata_core::{FlowId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created, waiting for an orchestrator to pick it up.
    Pending,
    /// An orchestrator is driving the run.
    Running,
    /// Every step completed successfully.
    Succeeded,
    /// At least one step failed, or initialization failed.
    Failed,
    /// Cancelled by a user before completion.
    Cancelled,
}

impl RunStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

/// A requested execution of a specific `(flow_id, version)`.
///
/// The status moves monotonically toward one terminal state; once terminal,
/// nothing moves it again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier.
    pub id: RunId,
    /// The flow being executed.
    pub flow_id: FlowId,
    /// The exact version being executed.
    pub version: i32,
    /// Current status.
    pub status: RunStatus,
    /// Inputs snapshot taken at creation.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// When the run left PENDING.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Error text for FAILED runs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Deduplication key, unique within the flow.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,
    /// Marks test executions.
    #[serde(default)]
    pub is_sandbox: bool,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// Creates a PENDING run for a flow version.
    #[must_use]
    pub fn new(flow_id: FlowId, version: i32, inputs: Map<String, Value>) -> Self {
        Self {
            id: RunId::generate(),
            flow_id,
            version,
            status: RunStatus::Pending,
            inputs,
            started_at: None,
            finished_at: None,
            error: String::new(),
            idempotency_key: String::new(),
            is_sandbox: false,
            created_at: Utc::now(),
        }
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    /// Returns true if the run is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the wall-clock duration, or None while the run is open.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Moves the run to RUNNING. No-op once terminal.
    pub fn mark_running(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Moves the run to SUCCEEDED. No-op once terminal.
    pub fn mark_succeeded(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = RunStatus::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    /// Moves the run to FAILED with an error message. No-op once terminal.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = RunStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = error.into();
    }

    /// Moves the run to CANCELLED. No-op once terminal.
    pub fn mark_cancelled(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = RunStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}
