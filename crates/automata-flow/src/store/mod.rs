//! Pluggable storage for coordination state.
//!
//! The [`Store`] trait is the durability contract the scheduler,
//! orchestrator and worker depend on. Absent rows are `Ok(None)` — the
//! not-found sentinel that distinguishes "no such row" from an I/O failure,
//! which surfaces as [`crate::error::Error::Storage`].
//!
//! ## Design Principles
//!
//! - **The store owns persisted truth**: in-memory run state is a rebuildable
//!   cache over it
//! - **Uniqueness is enforced here**: `(flow_id, idempotency_key)` for runs
//!   and `(run_id, step_id)` for tasks are the idempotency backstops
//! - **Testability**: [`memory::InMemoryStore`] for tests and the dev stack,
//!   a relational backend in production

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use automata_core::{FlowId, RunId, ScheduleId, TaskId};

use crate::error::Result;
use crate::flow::{Flow, FlowVersion};
use crate::run::Run;
use crate::schedule::Schedule;
use crate::spec::FlowSpec;
use crate::task::Task;

/// Storage abstraction for coordination state.
///
/// All methods are `Send + Sync` to support concurrent access from the
/// service loops.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Run operations ---

    /// Inserts a run.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::DuplicateIdempotencyKey`] when a run
    /// with the same `(flow_id, idempotency_key)` already exists.
    async fn create_run(&self, run: &Run) -> Result<()>;

    /// Gets a run by id, or `None` if absent.
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>>;

    /// Looks up the run created for an idempotency key, or `None`.
    async fn get_run_by_idempotency_key(
        &self,
        flow_id: FlowId,
        key: &str,
    ) -> Result<Option<Run>>;

    /// Lists PENDING runs, oldest first, capped at `limit`.
    async fn list_pending_runs(&self, limit: usize) -> Result<Vec<Run>>;

    /// Rewrites a run's status, timestamps and error.
    async fn update_run(&self, run: &Run) -> Result<()>;

    // --- Task operations ---

    /// Inserts a task.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::DuplicateTask`] when a task for the
    /// same `(run_id, step_id)` already exists.
    async fn create_task(&self, task: &Task) -> Result<()>;

    /// Gets a task by id, or `None` if absent.
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>>;

    /// Rewrites a task row.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Lists QUEUED tasks, oldest first, capped at `limit`.
    async fn list_queued_tasks(&self, limit: usize) -> Result<Vec<Task>>;

    /// Lists every task for a run in ascending creation order.
    async fn list_tasks_by_run(&self, run_id: RunId) -> Result<Vec<Task>>;

    // --- Flow operations ---

    /// Inserts a flow.
    async fn create_flow(&self, flow: &Flow) -> Result<()>;

    /// Gets a flow by id, or `None` if absent.
    async fn get_flow(&self, flow_id: FlowId) -> Result<Option<Flow>>;

    /// Inserts a new version with number `max(version) + 1`, atomically.
    async fn create_version(&self, flow_id: FlowId, spec: FlowSpec) -> Result<FlowVersion>;

    /// Gets a specific version, or `None` if absent.
    async fn get_version(&self, flow_id: FlowId, version: i32) -> Result<Option<FlowVersion>>;

    /// Gets the highest version, or `None` when the flow has no versions.
    async fn get_latest_version(&self, flow_id: FlowId) -> Result<Option<FlowVersion>>;

    // --- Schedule operations ---

    /// Inserts a schedule.
    async fn create_schedule(&self, schedule: &Schedule) -> Result<()>;

    /// Lists enabled schedules with `next_due_at <= now`, ascending by
    /// `next_due_at`, capped at `limit`.
    async fn list_due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>>;

    /// Rewrites a schedule row.
    async fn update_schedule(&self, schedule: &Schedule) -> Result<()>;

    /// Flips a schedule's enabled flag.
    async fn set_schedule_enabled(&self, schedule_id: ScheduleId, enabled: bool) -> Result<()>;

    // --- Advisory lock ---

    /// Attempts to take the advisory lock, non-blocking.
    ///
    /// Returns true when this process now holds the lock (re-acquiring a
    /// lock already held by this process also returns true).
    async fn try_advisory_lock(&self, key: i64) -> Result<bool>;

    /// Releases the advisory lock. Returns true when it was held.
    async fn release_advisory_lock(&self, key: i64) -> Result<bool>;
}
