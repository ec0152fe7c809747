//! The orchestrator: turns PENDING runs into driven sequences of tasks.
//!
//! Two event inputs — `run.pending` and `task.completed` — plus a periodic
//! poll over `list_pending_runs` as the catch-up path for lost events and
//! restarts. Each driven run holds a [`RunState`] in the process-local
//! active set; a run missing from the set when a completion arrives is
//! restored from the store (or ignored when it is already terminal).
//!
//! Parallel start nodes and join nodes never become tasks: the orchestrator
//! resolves them in-place and immediately re-evaluates the ready set, so
//! branch steps dispatch in the same pass.

mod state;

pub use state::{RunState, RunStats};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use automata_core::config::OrchestratorConfig;
use automata_core::RunId;

use crate::broker::{
    Consumer, ConsumerConfig, EventBus, Message, MessageHandler, Publisher, QueueName,
    RunPendingPayload, TaskCompletedPayload,
};
use crate::dag::DagNode;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::run::{Run, RunStatus};
use crate::spec::StepType;
use crate::store::Store;
use crate::task::{Task, TaskStatus};
use crate::template;

/// Prefetch for the orchestrator's consumers.
const CONSUMER_PREFETCH: usize = 10;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("active set lock poisoned")
}

/// Coordinates run execution: builds DAGs, dispatches tasks, finalizes runs.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    publisher: Publisher,
    active: RwLock<HashMap<RunId, Arc<RunState>>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator over a store and bus.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            publisher: Publisher::new(bus.clone()),
            bus,
            active: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Runs consumers and the poll loop until cancelled.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "starting orchestrator"
        );

        let run_consumer = Consumer::new(
            self.bus.clone(),
            ConsumerConfig {
                queue: QueueName::RunsPending,
                prefetch: CONSUMER_PREFETCH,
                handler: Arc::new(RunPendingHandler {
                    orchestrator: self.clone(),
                }),
            },
        );
        let task_consumer = Consumer::new(
            self.bus.clone(),
            ConsumerConfig {
                queue: QueueName::TasksCompleted,
                prefetch: CONSUMER_PREFETCH,
                handler: Arc::new(TaskCompletedHandler {
                    orchestrator: self.clone(),
                }),
            },
        );

        tokio::join!(
            run_consumer.run(cancel.clone()),
            task_consumer.run(cancel.clone()),
            self.poll_loop(cancel.clone()),
        );

        info!(
            active_runs = self.active_run_count(),
            "orchestrator stopped"
        );
    }

    /// Number of runs currently in the active set.
    #[must_use]
    pub fn active_run_count(&self) -> usize {
        self.active.read().map(|a| a.len()).unwrap_or(0)
    }

    /// Returns progress for an active run, if present.
    #[must_use]
    pub fn active_run_stats(&self, run_id: RunId) -> Option<RunStats> {
        let active = self.active.read().ok()?;
        active.get(&run_id)?.stats().ok()
    }

    async fn poll_loop(&self, cancel: CancellationToken) {
        // First poll immediately, picking up runs created while we were down.
        self.poll().await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => self.poll().await,
            }
        }
    }

    /// One polling pass over pending runs.
    pub async fn poll(&self) {
        let runs = match self.store.list_pending_runs(self.config.batch_size).await {
            Ok(runs) => runs,
            Err(err) => {
                error!(%err, "failed to list pending runs");
                return;
            }
        };

        if runs.is_empty() {
            return;
        }
        debug!(count = runs.len(), "poll found pending runs");

        for run in runs {
            if self.is_run_active(run.id) {
                continue;
            }
            if let Err(err) = self.process_run(run.id).await {
                match err {
                    Error::RunNotPending | Error::RunAlreadyActive => {
                        debug!(run_id = %run.id, %err, "run not processed");
                    }
                    err => error!(run_id = %run.id, %err, "failed to process run from poll"),
                }
            }
        }
    }

    fn is_run_active(&self, run_id: RunId) -> bool {
        self.active
            .read()
            .map(|active| active.contains_key(&run_id))
            .unwrap_or(false)
    }

    fn get_active_run(&self, run_id: RunId) -> Option<Arc<RunState>> {
        self.active.read().ok()?.get(&run_id).cloned()
    }

    fn add_active_run(&self, state: Arc<RunState>) -> Result<()> {
        let mut active = self.active.write().map_err(poison_err)?;
        if active.contains_key(&state.run_id()) {
            return Err(Error::RunAlreadyActive);
        }
        active.insert(state.run_id(), state);
        FlowMetrics::set_active_runs(active.len());
        Ok(())
    }

    fn remove_active_run(&self, run_id: RunId) {
        if let Ok(mut active) = self.active.write() {
            active.remove(&run_id);
            FlowMetrics::set_active_runs(active.len());
        }
    }

    /// Picks up a PENDING run: validates, builds the DAG, transitions the
    /// run to RUNNING and dispatches the initial ready set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] for unknown runs,
    /// [`Error::RunNotPending`] when another coordinator got there first,
    /// [`Error::RunAlreadyActive`] on duplicate activation, and storage
    /// errors verbatim. Spec-invalid runs are failed in the store and do
    /// not error here.
    pub async fn process_run(&self, run_id: RunId) -> Result<()> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Err(Error::RunNotFound { run_id });
        };

        if run.status != RunStatus::Pending {
            return Err(Error::RunNotPending);
        }

        let Some(version) = self.store.get_version(run.flow_id, run.version).await? else {
            let message = format!("flow version not found: {} v{}", run.flow_id, run.version);
            return self.fail_run(run, &message).await;
        };

        let mut state = RunState::new(run, version);
        if let Err(err) = state.initialize() {
            let message = format!("initialization failed: {err}");
            return self.fail_run(state.run, &message).await;
        }

        state.run.mark_running();
        let state = Arc::new(state);
        self.add_active_run(state.clone())?;

        if let Err(err) = self.store.update_run(&state.run).await {
            self.remove_active_run(run_id);
            return Err(err);
        }

        FlowMetrics::record_run_started();
        info!(
            run_id = %run_id,
            flow_id = %state.flow_id(),
            version = state.version.version,
            steps = state.dag().size(),
            "run started"
        );

        if let Err(err) = self.dispatch_ready_steps(&state).await {
            // Dispatch retries on the next completion or poll; the run
            // stays active.
            error!(run_id = %run_id, %err, "failed to dispatch initial steps");
        }

        Ok(())
    }

    /// Applies a task completion to its run and advances or finalizes it.
    ///
    /// # Errors
    ///
    /// Returns storage errors verbatim; the consumer requeues on them.
    pub async fn process_task_completed(&self, payload: TaskCompletedPayload) -> Result<()> {
        let state = match self.get_active_run(payload.run_id) {
            Some(state) => state,
            None => match self.restore_run_state(payload.run_id).await? {
                Some(state) => state,
                None => {
                    debug!(run_id = %payload.run_id, "run not active and not restorable");
                    return Ok(());
                }
            },
        };

        // The store is authoritative for outputs; the payload only signals.
        let Some(task) = self.store.get_task(payload.task_id).await? else {
            return Err(Error::TaskNotFound {
                task_id: payload.task_id,
            });
        };

        if payload.status == TaskStatus::Succeeded {
            state.mark_step_completed(&payload.step_id, Some(task.outputs))?;
            debug!(run_id = %payload.run_id, step_id = %payload.step_id, "step completed");
        } else {
            state.mark_step_failed(&payload.step_id)?;
            warn!(
                run_id = %payload.run_id,
                step_id = %payload.step_id,
                error = %payload.error,
                "step failed"
            );
        }

        if state.has_failed()? {
            return self.complete_run(&state, false).await;
        }
        if state.is_complete()? {
            return self.complete_run(&state, true).await;
        }
        self.dispatch_ready_steps(&state).await
    }

    /// Dispatches every ready step, re-evaluating after virtual nodes
    /// (parallel starts, condition skips) resolve so the nodes they unblock
    /// go out in the same pass.
    async fn dispatch_ready_steps(&self, state: &Arc<RunState>) -> Result<()> {
        loop {
            let ready = state.ready_steps()?;
            if ready.is_empty() {
                return Ok(());
            }

            let mut resolved_virtual = false;
            for step_id in ready {
                match self.dispatch_step(state, &step_id).await {
                    Ok(dispatched) => resolved_virtual |= dispatched == Dispatch::Resolved,
                    Err(err) => {
                        error!(
                            run_id = %state.run_id(),
                            step_id = %step_id,
                            %err,
                            "failed to dispatch step"
                        );
                    }
                }
            }

            if !resolved_virtual {
                return Ok(());
            }
        }
    }

    async fn dispatch_step(&self, state: &Arc<RunState>, step_id: &str) -> Result<Dispatch> {
        let node = state
            .dag()
            .node(step_id)
            .cloned()
            .ok_or_else(|| Error::validation(step_id, "id", "node missing from DAG"))?;

        // Parallel start nodes are containers, not work; completing them
        // unblocks the branch chains.
        if node_is_parallel(&node) {
            state.mark_step_completed(step_id, None)?;
            return Ok(Dispatch::Resolved);
        }

        let step = node
            .step
            .as_ref()
            .ok_or_else(|| Error::validation(step_id, "id", "node has no step definition"))?;

        let ctx = state.context_snapshot()?;
        let config = template::render_config(&step.config, &ctx)
            .map_err(|err| Error::validation(step_id, "config", err.to_string()))?;

        if !step.condition.is_empty() {
            let should_run = template::render_condition(&step.condition, &ctx)
                .map_err(|err| Error::validation(step_id, "condition", err.to_string()))?;
            if !should_run {
                debug!(run_id = %state.run_id(), step_id, "step skipped by condition");
                let mut outputs = Map::new();
                outputs.insert("skipped".to_string(), Value::Bool(true));
                state.mark_step_completed(step_id, Some(outputs))?;
                return Ok(Dispatch::Resolved);
            }
        }

        let task = Task::new(
            state.run_id(),
            step_id,
            step.name.clone(),
            step.step_type,
            config,
        );

        match self.store.create_task(&task).await {
            Ok(()) => {}
            Err(Error::DuplicateTask { .. }) => {
                // Another coordinator (or an earlier attempt) already
                // persisted this step's task; just track it as running.
                debug!(run_id = %state.run_id(), step_id, "task already exists");
                state.mark_step_running(step_id, task)?;
                return Ok(Dispatch::Announced);
            }
            Err(err) => return Err(err),
        }

        state.mark_step_running(step_id, task.clone())?;
        FlowMetrics::record_task_dispatched(step.step_type.as_str());

        if let Err(err) = self
            .publisher
            .publish_task_ready(task.id, state.run_id())
            .await
        {
            // The task is persisted QUEUED; the worker's poll will find it.
            warn!(task_id = %task.id, run_id = %state.run_id(), %err, "failed to publish task.ready");
        }

        debug!(
            task_id = %task.id,
            run_id = %state.run_id(),
            step_id,
            step_type = %step.step_type,
            "task dispatched"
        );

        Ok(Dispatch::Announced)
    }

    async fn complete_run(&self, state: &Arc<RunState>, success: bool) -> Result<()> {
        let mut run = state.run.clone();

        if success {
            run.mark_succeeded();
            FlowMetrics::record_run_completed("succeeded");
            info!(run_id = %run.id, duration = ?run.duration(), "run succeeded");
        } else {
            let failed = state.failed_steps()?;
            run.mark_failed(format!("steps failed: [{}]", failed.join(" ")));
            FlowMetrics::record_run_completed("failed");
            warn!(
                run_id = %run.id,
                failed_steps = ?failed,
                duration = ?run.duration(),
                "run failed"
            );
        }

        self.store.update_run(&run).await?;
        self.remove_active_run(run.id);
        Ok(())
    }

    async fn fail_run(&self, mut run: Run, message: &str) -> Result<()> {
        run.mark_failed(message);
        self.store.update_run(&run).await?;
        FlowMetrics::record_run_completed("failed");
        warn!(run_id = %run.id, error = message, "run failed early");
        Ok(())
    }

    /// Rebuilds a [`RunState`] from the store after a restart.
    ///
    /// Returns `None` when the run does not exist or is already terminal —
    /// late completions for finished runs are ignored this way.
    async fn restore_run_state(&self, run_id: RunId) -> Result<Option<Arc<RunState>>> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(None);
        };
        if run.is_terminal() {
            return Ok(None);
        }

        let Some(version) = self.store.get_version(run.flow_id, run.version).await? else {
            return Ok(None);
        };

        let mut state = RunState::new(run, version);
        state.initialize()?;

        let tasks = self.store.list_tasks_by_run(run_id).await?;
        state.restore_from_tasks(tasks)?;

        let state = Arc::new(state);
        match self.add_active_run(state.clone()) {
            Ok(()) => {}
            Err(Error::RunAlreadyActive) => {
                // Lost the restore race; use the winner.
                return Ok(self.get_active_run(run_id));
            }
            Err(err) => return Err(err),
        }

        info!(run_id = %run_id, stats = ?state.stats()?, "run state restored");
        Ok(Some(state))
    }
}

/// What dispatching one node did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// A task was persisted and announced (or already existed).
    Announced,
    /// The node resolved in place (parallel start or condition skip); the
    /// ready set must be re-evaluated.
    Resolved,
}

fn node_is_parallel(node: &DagNode) -> bool {
    node.step.as_ref().map(|s| s.step_type) == Some(StepType::Parallel)
}

struct RunPendingHandler {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl MessageHandler for RunPendingHandler {
    async fn handle(&self, message: Message) -> Result<()> {
        let payload: RunPendingPayload = message.parse_payload()?;
        debug!(run_id = %payload.run_id, "received run.pending");

        if self.orchestrator.is_run_active(payload.run_id) {
            debug!(run_id = %payload.run_id, "run already active, skipping");
            return Ok(());
        }

        match self.orchestrator.process_run(payload.run_id).await {
            Ok(()) => Ok(()),
            // Expected during races and restarts; ack instead of requeue.
            Err(Error::RunNotPending | Error::RunAlreadyActive | Error::RunNotFound { .. }) => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

struct TaskCompletedHandler {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl MessageHandler for TaskCompletedHandler {
    async fn handle(&self, message: Message) -> Result<()> {
        let payload: TaskCompletedPayload = message.parse_payload()?;
        debug!(
            task_id = %payload.task_id,
            run_id = %payload.run_id,
            step_id = %payload.step_id,
            status = %payload.status,
            "received task.completed"
        );
        self.orchestrator.process_task_completed(payload).await
    }
}
