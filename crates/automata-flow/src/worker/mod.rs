//! The worker: pulls ready tasks, executes them by step type, retries
//! within policy and writes the outcome back.
//!
//! Intake is event-driven (`tasks.ready` consumer) with a poll over
//! `list_queued_tasks` as the catch-up path. Workers are stateless and
//! scale horizontally; the store's QUEUED check keeps a task from being
//! executed twice.

mod delay;
mod executor;
mod http;
mod transform;

pub use delay::DelayExecutor;
pub use executor::{ExecutionResult, Executor, Registry};
pub use http::HttpExecutor;
pub use transform::TransformExecutor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use automata_core::config::WorkerConfig;
use automata_core::TaskId;

use crate::broker::{
    Consumer, ConsumerConfig, EventBus, Message, MessageHandler, Publisher, QueueName,
    TaskCompletedPayload, TaskReadyPayload,
};
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::spec::RetryPolicy;
use crate::store::Store;
use crate::task::Task;

const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Executes tasks pulled from the queue and the polling fallback.
pub struct Worker {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    publisher: Publisher,
    registry: Arc<Registry>,
    config: WorkerConfig,
}

impl Worker {
    /// Creates a worker with the default executor registry.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn EventBus>, config: WorkerConfig) -> Arc<Self> {
        Self::with_registry(store, bus, config, Arc::new(Registry::new()))
    }

    /// Creates a worker with a custom registry.
    #[must_use]
    pub fn with_registry(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        config: WorkerConfig,
        registry: Arc<Registry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            publisher: Publisher::new(bus.clone()),
            bus,
            registry,
            config,
        })
    }

    /// Runs the consumer and poll loop until cancelled.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            prefetch = self.config.prefetch,
            "starting worker"
        );

        let consumer = Consumer::new(
            self.bus.clone(),
            ConsumerConfig {
                queue: QueueName::TasksReady,
                prefetch: self.config.prefetch,
                handler: Arc::new(TaskReadyHandler {
                    worker: self.clone(),
                    cancel: cancel.clone(),
                }),
            },
        );

        tokio::join!(consumer.run(cancel.clone()), self.poll_loop(cancel.clone()));

        info!("worker stopped");
    }

    async fn poll_loop(&self, cancel: CancellationToken) {
        self.poll(&cancel).await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => self.poll(&cancel).await,
            }
        }
    }

    /// One polling pass over queued tasks.
    pub async fn poll(&self, cancel: &CancellationToken) {
        let tasks = match self.store.list_queued_tasks(self.config.batch_size).await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(%err, "failed to list queued tasks");
                return;
            }
        };

        if tasks.is_empty() {
            return;
        }
        debug!(count = tasks.len(), "poll found queued tasks");

        for task in tasks {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = self.process_task(task.id, cancel).await {
                match err {
                    Error::TaskNotQueued | Error::TaskNotFound { .. } => {
                        debug!(task_id = %task.id, %err, "task not processed");
                    }
                    err => error!(task_id = %task.id, %err, "failed to process task from poll"),
                }
            }
        }
    }

    /// Executes one task to its terminal status, retrying within policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] / [`Error::TaskNotQueued`] for
    /// no-op deliveries, [`Error::Cancelled`] when shutdown interrupts a
    /// backoff sleep, and storage errors verbatim.
    pub async fn process_task(&self, task_id: TaskId, cancel: &CancellationToken) -> Result<()> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(Error::TaskNotFound { task_id });
        };

        if task.status != crate::task::TaskStatus::Queued {
            return Err(Error::TaskNotQueued);
        }

        task.mark_running();
        self.store.update_task(&task).await?;
        FlowMetrics::record_task_attempt(task.step_type.as_str());

        info!(
            task_id = %task.id,
            run_id = %task.run_id,
            step_id = %task.step_id,
            step_type = %task.step_type,
            attempt = task.attempt,
            "task started"
        );

        let policy = self.retry_policy_for(&task).await;
        let outcome = self.execute_with_retry(&mut task, policy.as_ref(), cancel).await?;

        match outcome {
            Attempt::Succeeded(outputs) => {
                task.mark_succeeded(outputs);
                self.store.update_task(&task).await?;
                FlowMetrics::record_task_completed("succeeded");
                self.observe_duration(&task, "succeeded");
                info!(
                    task_id = %task.id,
                    run_id = %task.run_id,
                    step_id = %task.step_id,
                    attempt = task.attempt,
                    "task succeeded"
                );
                self.publish_completion(&task, String::new()).await;
            }
            Attempt::Failed(message) => {
                task.mark_failed(message.clone());
                self.store.update_task(&task).await?;
                FlowMetrics::record_task_completed("failed");
                self.observe_duration(&task, "failed");
                warn!(
                    task_id = %task.id,
                    run_id = %task.run_id,
                    step_id = %task.step_id,
                    attempt = task.attempt,
                    error = %message,
                    "task failed"
                );
                self.publish_completion(&task, message).await;
            }
        }

        Ok(())
    }

    /// Runs attempts until success, exhaustion or a non-retriable failure.
    async fn execute_with_retry(
        &self,
        task: &mut Task,
        policy: Option<&RetryPolicy>,
        cancel: &CancellationToken,
    ) -> Result<Attempt> {
        // A missing executor is a permanent condition; retrying or
        // requeueing would never converge.
        let executor = match self.registry.get(task.step_type.as_str()) {
            Ok(executor) => executor,
            Err(err) => return Ok(Attempt::Failed(err.to_string())),
        };
        let max_attempts = policy.map_or(1, |p| p.max_attempts.max(1));

        loop {
            let attempt = executor.execute(task, cancel).await;

            let (result, infra_error) = match attempt {
                Ok(result) if result.is_success() => {
                    return Ok(Attempt::Succeeded(result.outputs));
                }
                Ok(result) => (Some(result), None),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => (None, Some(err)),
            };

            let message = infra_error.as_ref().map_or_else(
                || {
                    result
                        .as_ref()
                        .and_then(|r| r.error.clone())
                        .unwrap_or_default()
                },
                ToString::to_string,
            );

            if !task.can_retry(max_attempts)
                || !should_retry(result.as_ref(), infra_error.is_some(), policy)
            {
                return Ok(Attempt::Failed(message));
            }

            let delay = backoff(task.attempt, policy);
            debug!(
                task_id = %task.id,
                attempt = task.attempt,
                ?delay,
                "retrying task"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(Error::Cancelled),
            }

            task.reset_for_retry();
            task.mark_running();
            self.store.update_task(task).await?;
            FlowMetrics::record_task_attempt(task.step_type.as_str());
        }
    }

    /// Loads the effective retry policy: step-level override first, then
    /// the spec defaults. Lookup failures quietly mean "no policy".
    async fn retry_policy_for(&self, task: &Task) -> Option<RetryPolicy> {
        let run = match self.store.get_run(task.run_id).await {
            Ok(Some(run)) => run,
            Ok(None) | Err(_) => {
                debug!(run_id = %task.run_id, "failed to load run for retry policy");
                return None;
            }
        };

        let version = match self.store.get_version(run.flow_id, run.version).await {
            Ok(Some(version)) => version,
            Ok(None) | Err(_) => {
                debug!(flow_id = %run.flow_id, "failed to load flow version for retry policy");
                return None;
            }
        };

        version.spec.retry_policy_for(&task.step_id).cloned()
    }

    async fn publish_completion(&self, task: &Task, error: String) {
        let payload = TaskCompletedPayload {
            task_id: task.id,
            run_id: task.run_id,
            step_id: task.step_id.clone(),
            status: task.status,
            error,
            attempt: task.attempt,
        };

        if let Err(err) = self.publisher.publish_task_completed(payload).await {
            // The task row is already terminal; the orchestrator's restore
            // path will see it on the next poll-driven touch of the run.
            warn!(task_id = %task.id, %err, "failed to publish task.completed");
        }
    }

    fn observe_duration(&self, task: &Task, status: &'static str) {
        if let Some(duration) = task.duration() {
            let seconds = duration.num_milliseconds().max(0) as f64 / 1000.0;
            FlowMetrics::observe_task_duration(step_type_label(task), status, seconds);
        }
    }
}

fn step_type_label(task: &Task) -> &'static str {
    task.step_type.as_str()
}

/// Outcome of the retry loop.
enum Attempt {
    Succeeded(serde_json::Map<String, serde_json::Value>),
    Failed(String),
}

/// Decides whether a failed attempt is retriable.
///
/// Infrastructure errors always are. Logical errors are, unless the policy
/// pins `on_status` and the attempt's `status_code` is not in the list (or
/// absent).
fn should_retry(result: Option<&ExecutionResult>, infra_error: bool, policy: Option<&RetryPolicy>) -> bool {
    if infra_error {
        return true;
    }

    let Some(policy) = policy else {
        return false;
    };

    if !policy.on_status.is_empty() {
        let status_code = result
            .and_then(|r| r.outputs.get("status_code"))
            .and_then(serde_json::Value::as_u64);
        return status_code
            .and_then(|code| u16::try_from(code).ok())
            .is_some_and(|code| policy.on_status.contains(&code));
    }

    true
}

/// Computes the delay before the next attempt.
///
/// No policy means a single attempt, so the 1s here is never observed.
/// `"exponential"` doubles the initial delay per attempt, clipped at the
/// max; `"fixed"` (or anything unrecognized) uses the initial delay as-is.
#[must_use]
pub fn backoff(attempt: u32, policy: Option<&RetryPolicy>) -> Duration {
    let Some(policy) = policy else {
        return DEFAULT_BACKOFF;
    };

    let initial = if policy.initial_delay_ms > 0 {
        Duration::from_millis(policy.initial_delay_ms)
    } else {
        DEFAULT_BACKOFF
    };
    let max = if policy.max_delay_ms > 0 {
        Duration::from_millis(policy.max_delay_ms)
    } else {
        DEFAULT_MAX_BACKOFF
    };

    let delay = if policy.backoff == "exponential" {
        let doublings = attempt.saturating_sub(1).min(32);
        initial.saturating_mul(2_u32.saturating_pow(doublings).max(1))
    } else {
        initial
    };

    delay.min(max)
}

struct TaskReadyHandler {
    worker: Arc<Worker>,
    cancel: CancellationToken,
}

#[async_trait]
impl MessageHandler for TaskReadyHandler {
    async fn handle(&self, message: Message) -> Result<()> {
        let payload: TaskReadyPayload = message.parse_payload()?;
        debug!(task_id = %payload.task_id, run_id = %payload.run_id, "received task.ready");

        match self.worker.process_task(payload.task_id, &self.cancel).await {
            Ok(()) => Ok(()),
            // Already executed or raced with the poll loop; ack.
            Err(Error::TaskNotFound { .. } | Error::TaskNotQueued) => {
                debug!(task_id = %payload.task_id, "task not processed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff_kind: &str, initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 6,
            backoff: backoff_kind.to_string(),
            initial_delay_ms: initial_ms,
            max_delay_ms: max_ms,
            on_status: vec![],
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_clips() {
        let policy = policy("exponential", 1_000, 10_000);
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| backoff(attempt, Some(&policy)).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn fixed_and_unknown_backoff_use_initial_delay() {
        let fixed = policy("fixed", 500, 10_000);
        assert_eq!(backoff(1, Some(&fixed)), Duration::from_millis(500));
        assert_eq!(backoff(5, Some(&fixed)), Duration::from_millis(500));

        let unknown = policy("fibonacci", 700, 10_000);
        assert_eq!(backoff(3, Some(&unknown)), Duration::from_millis(700));
    }

    #[test]
    fn backoff_defaults() {
        assert_eq!(backoff(1, None), Duration::from_secs(1));

        let zeroed = policy("exponential", 0, 0);
        assert_eq!(backoff(1, Some(&zeroed)), Duration::from_secs(1));
        // Doubles from the 1s default, capped at the 30s default.
        assert_eq!(backoff(10, Some(&zeroed)), Duration::from_secs(30));
    }

    #[test]
    fn infra_errors_always_retry() {
        assert!(should_retry(None, true, None));
        assert!(should_retry(None, true, Some(&policy("fixed", 1, 1))));
    }

    #[test]
    fn logical_errors_respect_on_status() {
        let mut with_status = policy("fixed", 1, 1);
        with_status.on_status = vec![503];

        let mut outputs = serde_json::Map::new();
        outputs.insert("status_code".into(), serde_json::Value::from(503));
        let result_503 = ExecutionResult {
            outputs,
            error: Some("HTTP 503: unavailable".into()),
        };
        assert!(should_retry(Some(&result_503), false, Some(&with_status)));

        let mut outputs = serde_json::Map::new();
        outputs.insert("status_code".into(), serde_json::Value::from(404));
        let result_404 = ExecutionResult {
            outputs,
            error: Some("HTTP 404: missing".into()),
        };
        assert!(!should_retry(Some(&result_404), false, Some(&with_status)));

        // on_status set but no status_code in outputs: no retry.
        let bare = ExecutionResult {
            outputs: serde_json::Map::new(),
            error: Some("logical".into()),
        };
        assert!(!should_retry(Some(&bare), false, Some(&with_status)));

        // No on_status restriction: logical errors retry.
        assert!(should_retry(Some(&bare), false, Some(&policy("fixed", 1, 1))));

        // No policy at all: no retry.
        assert!(!should_retry(Some(&bare), false, None));
    }
}
