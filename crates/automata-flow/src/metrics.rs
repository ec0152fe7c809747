//! Observability metrics for the coordination layer.
//!
//! Exposed via the `metrics` crate facade; the service binaries install a
//! Prometheus recorder and serve the scrape endpoint at `/metrics`.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `automata_runs_started_total` | Counter | - | Runs moved PENDING -> RUNNING |
//! | `automata_runs_completed_total` | Counter | `status` | Runs reaching a terminal state |
//! | `automata_active_runs` | Gauge | - | Runs currently held in the active set |
//! | `automata_tasks_dispatched_total` | Counter | `type` | Tasks persisted and announced |
//! | `automata_tasks_completed_total` | Counter | `status` | Task terminal outcomes |
//! | `automata_task_attempts_total` | Counter | `type` | Execution attempts, retries included |
//! | `automata_task_duration_seconds` | Histogram | `type`, `status` | Attempt wall-clock duration |
//! | `automata_scheduler_ticks_total` | Counter | `outcome` | Scheduler tick outcomes |
//! | `automata_scheduled_runs_total` | Counter | - | Runs created by the scheduler |
//! | `automata_messages_published_total` | Counter | `kind` | Bus publishes |
//! | `automata_messages_consumed_total` | Counter | `queue` | Bus deliveries decoded |
//! | `automata_handler_errors_total` | Counter | `queue` | Handler failures (requeued) |
//! | `automata_dead_letters_total` | Counter | `queue` | Messages routed to the DLQ |

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: runs moved PENDING -> RUNNING.
    pub const RUNS_STARTED_TOTAL: &str = "automata_runs_started_total";
    /// Counter: runs reaching a terminal state, by status.
    pub const RUNS_COMPLETED_TOTAL: &str = "automata_runs_completed_total";
    /// Gauge: runs currently held in the orchestrator's active set.
    pub const ACTIVE_RUNS: &str = "automata_active_runs";
    /// Counter: tasks persisted and announced, by step type.
    pub const TASKS_DISPATCHED_TOTAL: &str = "automata_tasks_dispatched_total";
    /// Counter: task terminal outcomes, by status.
    pub const TASKS_COMPLETED_TOTAL: &str = "automata_tasks_completed_total";
    /// Counter: execution attempts, retries included, by step type.
    pub const TASK_ATTEMPTS_TOTAL: &str = "automata_task_attempts_total";
    /// Histogram: attempt wall-clock duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "automata_task_duration_seconds";
    /// Counter: scheduler tick outcomes.
    pub const SCHEDULER_TICKS_TOTAL: &str = "automata_scheduler_ticks_total";
    /// Counter: runs created by the scheduler.
    pub const SCHEDULED_RUNS_TOTAL: &str = "automata_scheduled_runs_total";
    /// Counter: bus publishes, by message kind.
    pub const MESSAGES_PUBLISHED_TOTAL: &str = "automata_messages_published_total";
    /// Counter: bus deliveries decoded, by queue.
    pub const MESSAGES_CONSUMED_TOTAL: &str = "automata_messages_consumed_total";
    /// Counter: handler failures (message requeued), by queue.
    pub const HANDLER_ERRORS_TOTAL: &str = "automata_handler_errors_total";
    /// Counter: messages routed to the DLQ, by queue.
    pub const DEAD_LETTERS_TOTAL: &str = "automata_dead_letters_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Terminal status label (succeeded, failed, cancelled).
    pub const STATUS: &str = "status";
    /// Step type label (http, delay, transform).
    pub const STEP_TYPE: &str = "type";
    /// Tick outcome label (processed, empty, error).
    pub const OUTCOME: &str = "outcome";
    /// Message kind label (run.pending, task.ready, task.completed).
    pub const KIND: &str = "kind";
    /// Queue name label.
    pub const QUEUE: &str = "queue";
}

/// Recording helpers for coordination metrics.
///
/// Thin wrappers over the `metrics` macros so call sites stay one line and
/// the label vocabulary stays closed.
#[derive(Debug, Clone, Copy)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Records a run starting.
    pub fn record_run_started() {
        counter!(names::RUNS_STARTED_TOTAL).increment(1);
    }

    /// Records a run reaching a terminal status.
    pub fn record_run_completed(status: &'static str) {
        counter!(names::RUNS_COMPLETED_TOTAL, labels::STATUS => status).increment(1);
    }

    /// Sets the active-run gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_runs(count: usize) {
        gauge!(names::ACTIVE_RUNS).set(count as f64);
    }

    /// Records a task dispatch.
    pub fn record_task_dispatched(step_type: &'static str) {
        counter!(names::TASKS_DISPATCHED_TOTAL, labels::STEP_TYPE => step_type).increment(1);
    }

    /// Records a task terminal outcome.
    pub fn record_task_completed(status: &'static str) {
        counter!(names::TASKS_COMPLETED_TOTAL, labels::STATUS => status).increment(1);
    }

    /// Records one execution attempt.
    pub fn record_task_attempt(step_type: &'static str) {
        counter!(names::TASK_ATTEMPTS_TOTAL, labels::STEP_TYPE => step_type).increment(1);
    }

    /// Records the duration of a finished attempt.
    pub fn observe_task_duration(step_type: &'static str, status: &'static str, seconds: f64) {
        histogram!(
            names::TASK_DURATION_SECONDS,
            labels::STEP_TYPE => step_type,
            labels::STATUS => status,
        )
        .record(seconds);
    }

    /// Records a scheduler tick outcome.
    pub fn record_scheduler_tick(outcome: &'static str) {
        counter!(names::SCHEDULER_TICKS_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a run created by the scheduler.
    pub fn record_scheduled_run() {
        counter!(names::SCHEDULED_RUNS_TOTAL).increment(1);
    }

    /// Records a bus publish.
    pub fn record_message_published(kind: &'static str) {
        counter!(names::MESSAGES_PUBLISHED_TOTAL, labels::KIND => kind).increment(1);
    }

    /// Records a decoded delivery.
    pub fn record_message_consumed(queue: &'static str) {
        counter!(names::MESSAGES_CONSUMED_TOTAL, labels::QUEUE => queue).increment(1);
    }

    /// Records a handler failure.
    pub fn record_handler_error(queue: &'static str) {
        counter!(names::HANDLER_ERRORS_TOTAL, labels::QUEUE => queue).increment(1);
    }

    /// Records a dead-lettered message.
    pub fn record_dead_letter(queue: &'static str) {
        counter!(names::DEAD_LETTERS_TOTAL, labels::QUEUE => queue).increment(1);
    }
}
