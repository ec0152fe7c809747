//! The scheduler: turns due schedules into PENDING runs.
//!
//! A single leader — gated by an advisory lock in the store — scans enabled
//! schedules whose `next_due_at` has passed, creates a run for each (or
//! reuses the one an earlier tick already created, via the idempotency
//! key), advances `next_due_at`, and announces new runs on the bus.
//!
//! Per-schedule failures never abort the batch.

pub mod cron;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use automata_core::config::SchedulerConfig;
use automata_core::RunId;

use crate::broker::{EventBus, Publisher};
use crate::error::Result;
use crate::metrics::FlowMetrics;
use crate::run::Run;
use crate::schedule::Schedule;
use crate::store::Store;

/// How often the leader loop ticks (and non-leaders re-try the lock).
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Outcome of one tick, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Due schedules fetched.
    pub due: usize,
    /// Schedules processed without error.
    pub processed: usize,
    /// New runs created (reused runs excluded).
    pub runs_created: usize,
}

/// Creates runs from due schedules.
pub struct Scheduler {
    store: Arc<dyn Store>,
    publisher: Publisher,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Creates a scheduler over a store and bus.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn EventBus>, config: SchedulerConfig) -> Self {
        Self {
            store,
            publisher: Publisher::new(bus),
            config,
        }
    }

    /// Processes every due schedule once.
    ///
    /// # Errors
    ///
    /// Returns a storage error only when the due-schedule query itself
    /// fails; per-schedule errors are logged and skipped.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let schedules = self
            .store
            .list_due_schedules(now, self.config.batch_size)
            .await?;

        let mut summary = TickSummary {
            due: schedules.len(),
            ..TickSummary::default()
        };
        if schedules.is_empty() {
            return Ok(summary);
        }

        debug!(count = schedules.len(), "found due schedules");

        for mut schedule in schedules {
            match self.process_schedule(&mut schedule, now).await {
                Ok(created) => {
                    summary.processed += 1;
                    if created {
                        summary.runs_created += 1;
                    }
                }
                Err(err) => {
                    error!(
                        schedule_id = %schedule.id,
                        schedule_name = %schedule.name,
                        %err,
                        "failed to process schedule"
                    );
                }
            }
        }

        FlowMetrics::record_scheduler_tick("processed");
        info!(
            due = summary.due,
            processed = summary.processed,
            runs_created = summary.runs_created,
            "scheduler tick completed"
        );

        Ok(summary)
    }

    /// Processes one due schedule. Returns true when a new run was created.
    async fn process_schedule(&self, schedule: &mut Schedule, now: DateTime<Utc>) -> Result<bool> {
        // A schedule only lists as due with next_due_at set.
        let Some(due_at) = schedule.next_due_at else {
            return Ok(false);
        };

        let Some(version) = self.store.get_latest_version(schedule.flow_id).await? else {
            warn!(
                schedule_id = %schedule.id,
                flow_id = %schedule.flow_id,
                "flow has no versions, skipping schedule"
            );
            return Ok(false);
        };

        // One run per (schedule, due time), across restarts and retries.
        let idempotency_key = format!("{}_{}", schedule.id, due_at.timestamp());

        let existing = self
            .store
            .get_run_by_idempotency_key(schedule.flow_id, &idempotency_key)
            .await?;

        let (run_id, created) = if let Some(existing) = existing {
            debug!(
                schedule_id = %schedule.id,
                run_id = %existing.id,
                idempotency_key = %idempotency_key,
                "run already exists"
            );
            (existing.id, false)
        } else {
            let run_id = self
                .create_scheduled_run(schedule, version.version, &idempotency_key)
                .await?;
            info!(
                run_id = %run_id,
                schedule_id = %schedule.id,
                schedule_name = %schedule.name,
                flow_id = %schedule.flow_id,
                version = version.version,
                "created run from schedule"
            );
            FlowMetrics::record_scheduled_run();
            (run_id, true)
        };

        let next_due = match cron::next_due(schedule, now) {
            Ok(next_due) => next_due,
            Err(err) => {
                // A broken recurrence must not spin the schedule; leaving
                // next_due_at untouched parks it for operator attention.
                error!(schedule_id = %schedule.id, %err, "failed to compute next due time");
                return Ok(created);
            }
        };

        schedule.record_run(run_id, next_due, now);
        self.store.update_schedule(schedule).await?;

        if created {
            if let Err(err) = self.publisher.publish_run_pending(run_id).await {
                // The run row exists; the orchestrator's poll will find it.
                warn!(run_id = %run_id, %err, "failed to publish run.pending");
            }
        }

        Ok(created)
    }

    async fn create_scheduled_run(
        &self,
        schedule: &Schedule,
        version: i32,
        idempotency_key: &str,
    ) -> Result<RunId> {
        let run = Run::new(schedule.flow_id, version, schedule.inputs.clone())
            .with_idempotency_key(idempotency_key);
        let run_id = run.id;

        match self.store.create_run(&run).await {
            Ok(()) => Ok(run_id),
            Err(crate::error::Error::DuplicateIdempotencyKey { .. }) => {
                // Lost the race with another tick; reuse the winner's run.
                let existing = self
                    .store
                    .get_run_by_idempotency_key(schedule.flow_id, idempotency_key)
                    .await?;
                existing.map(|run| run.id).ok_or_else(|| {
                    crate::error::Error::storage("idempotency conflict with no stored run")
                })
            }
            Err(err) => Err(err),
        }
    }
}

/// The scheduler leader loop.
///
/// Every second the candidate confirms (or attempts) leadership through the
/// store's advisory lock, and while leader runs a tick. The lock is
/// released explicitly on shutdown so a standby takes over quickly.
pub struct LeaderLoop {
    store: Arc<dyn Store>,
    scheduler: Scheduler,
    lock_key: i64,
}

impl LeaderLoop {
    /// Creates the leader loop.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, scheduler: Scheduler) -> Self {
        let lock_key = scheduler.config.lock_key;
        Self {
            store,
            scheduler,
            lock_key,
        }
    }

    /// Runs until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(lock_key = self.lock_key, "starting scheduler leader loop");

        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut has_lock = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !has_lock {
                match self.store.try_advisory_lock(self.lock_key).await {
                    Ok(acquired) => {
                        has_lock = acquired;
                        if acquired {
                            info!("acquired scheduler leadership");
                        }
                    }
                    Err(err) => {
                        error!(%err, "advisory lock attempt failed");
                        continue;
                    }
                }
            }

            if !has_lock {
                continue;
            }

            if let Err(err) = self.scheduler.tick(Utc::now()).await {
                error!(%err, "scheduler tick failed");
                FlowMetrics::record_scheduler_tick("error");
            }
        }

        if has_lock {
            if let Err(err) = self.store.release_advisory_lock(self.lock_key).await {
                warn!(%err, "failed to release advisory lock");
            }
        }
        info!("scheduler leader loop stopped");
    }
}
