//! Schedules: recurrence rules that produce runs at their next-due times.

use automata_core::{FlowId, RunId, ScheduleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A recurrence attached to a flow.
///
/// Either a 5-field cron expression or a positive interval in seconds; when
/// both are set, cron wins. The scheduler checks `next_due_at` and creates a
/// run once the time has passed, then advances `next_due_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique identifier.
    pub id: ScheduleId,
    /// The flow to start.
    pub flow_id: FlowId,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Cron expression, e.g. `"0 9 * * *"`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron_expr: String,
    /// Interval in seconds, used when no cron expression is set.
    #[serde(default)]
    pub interval_sec: u64,
    /// IANA timezone name for cron evaluation; invalid names fall back to UTC.
    #[serde(default)]
    pub timezone: String,
    /// Disabled schedules are skipped by the scheduler.
    pub enabled: bool,
    /// Next time a run is due; None until first computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due_at: Option<DateTime<Utc>>,
    /// When the schedule last produced (or reused) a run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// The run the schedule last produced (or reused).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<RunId>,
    /// Inputs template passed to every created run.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// When the schedule was created.
    pub created_at: DateTime<Utc>,
    /// When the schedule was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Creates an enabled cron schedule.
    #[must_use]
    pub fn cron(flow_id: FlowId, cron_expr: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduleId::generate(),
            flow_id,
            name: String::new(),
            cron_expr: cron_expr.into(),
            interval_sec: 0,
            timezone: "UTC".to_string(),
            enabled: true,
            next_due_at: None,
            last_run_at: None,
            last_run_id: None,
            inputs: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates an enabled interval schedule.
    #[must_use]
    pub fn interval(flow_id: FlowId, interval_sec: u64) -> Self {
        let mut sched = Self::cron(flow_id, "");
        sched.interval_sec = interval_sec;
        sched
    }

    /// Returns true when the schedule uses a cron expression.
    #[must_use]
    pub fn is_cron(&self) -> bool {
        !self.cron_expr.is_empty()
    }

    /// Returns true when the schedule uses an interval.
    #[must_use]
    pub fn is_interval(&self) -> bool {
        self.cron_expr.is_empty() && self.interval_sec > 0
    }

    /// Returns true when the schedule should fire at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        self.next_due_at.is_some_and(|due| now >= due)
    }

    /// Records a produced (or reused) run and the next due time.
    pub fn record_run(&mut self, run_id: RunId, next_due: DateTime<Utc>, now: DateTime<Utc>) {
        self.last_run_at = Some(now);
        self.last_run_id = Some(run_id);
        self.next_due_at = Some(next_due);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_wins_over_interval() {
        let mut sched = Schedule::cron(FlowId::generate(), "0 * * * *");
        sched.interval_sec = 60;
        assert!(sched.is_cron());
        assert!(!sched.is_interval());
    }

    #[test]
    fn is_due_requires_enabled_and_past_due() {
        let mut sched = Schedule::interval(FlowId::generate(), 60);
        let now = Utc::now();
        assert!(!sched.is_due(now)); // no next_due_at yet

        sched.next_due_at = Some(now - chrono::Duration::seconds(5));
        assert!(sched.is_due(now));

        sched.enabled = false;
        assert!(!sched.is_due(now));
    }

    #[test]
    fn record_run_advances_bookkeeping() {
        let mut sched = Schedule::interval(FlowId::generate(), 60);
        let now = Utc::now();
        let run_id = RunId::generate();
        let next = now + chrono::Duration::seconds(60);

        sched.record_run(run_id, next, now);
        assert_eq!(sched.last_run_id, Some(run_id));
        assert_eq!(sched.last_run_at, Some(now));
        assert_eq!(sched.next_due_at, Some(next));
    }
}
