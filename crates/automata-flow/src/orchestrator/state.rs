//! In-memory state of one run being driven.
//!
//! A [`RunState`] is a transient cache over the store: the run row, its flow
//! version, the built DAG, the template context, and the per-step tracking
//! sets. It is rebuildable at any time from the persisted tasks via
//! [`RunState::restore_from_tasks`], which is how an orchestrator picks up a
//! run after a restart.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use automata_core::{FlowId, RunId};
use serde_json::{Map, Value};

use crate::dag::FlowDag;
use crate::error::{Error, Result};
use crate::flow::FlowVersion;
use crate::run::Run;
use crate::task::{Task, TaskStatus};
use crate::template::Context;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("run state lock poisoned")
}

/// Snapshot of a run's step progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Executable (non-join) nodes in the DAG.
    pub total_steps: usize,
    /// Completed nodes, joins included.
    pub completed_steps: usize,
    /// Steps currently running.
    pub running_steps: usize,
    /// Steps that failed.
    pub failed_steps: usize,
}

#[derive(Debug, Default)]
struct StateInner {
    context: Context,
    completed: HashSet<String>,
    running: HashSet<String>,
    failed: HashSet<String>,
    tasks: HashMap<String, Task>,
}

/// The orchestrator's working state for one active run.
#[derive(Debug)]
pub struct RunState {
    /// The run row as last persisted by this orchestrator.
    pub run: Run,
    /// The exact flow version being executed.
    pub version: FlowVersion,
    /// The dependency graph; built by [`RunState::initialize`].
    dag: Option<FlowDag>,
    inner: RwLock<StateInner>,
}

impl RunState {
    /// Creates an uninitialized state for a run.
    #[must_use]
    pub fn new(run: Run, version: FlowVersion) -> Self {
        Self {
            run,
            version,
            dag: None,
            inner: RwLock::new(StateInner::default()),
        }
    }

    /// Validates the spec, builds the DAG and seeds the template context
    /// with the run inputs.
    ///
    /// # Errors
    ///
    /// Returns the validation or cycle error; the caller fails the run with
    /// the message.
    pub fn initialize(&mut self) -> Result<()> {
        self.version.spec.validate()?;
        let dag = FlowDag::build(&self.version.spec)?;
        self.dag = Some(dag);

        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.context = Context::new(self.run.inputs.clone());
        Ok(())
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run.id
    }

    /// The flow id.
    #[must_use]
    pub fn flow_id(&self) -> FlowId {
        self.run.flow_id
    }

    /// The DAG, present after [`RunState::initialize`].
    ///
    /// # Panics
    ///
    /// Panics when called before initialization; orchestrator code paths
    /// only reach this after a successful `initialize`.
    #[must_use]
    pub fn dag(&self) -> &FlowDag {
        self.dag.as_ref().expect("run state not initialized")
    }

    /// Computes the dispatchable steps, absorbing auto-resolved join nodes
    /// into the completed set first.
    ///
    /// The ready-set computation itself is pure; the join absorption is the
    /// only mutation and happens under the write lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn ready_steps(&self) -> Result<Vec<String>> {
        let dag = self.dag();

        let ready_set = {
            let inner = self.inner.read().map_err(poison_err)?;
            dag.ready_set(&inner.completed, &inner.running)
        };

        if !ready_set.resolved_joins.is_empty() {
            let mut inner = self.inner.write().map_err(poison_err)?;
            for join_id in &ready_set.resolved_joins {
                inner.completed.insert(join_id.clone());
            }
        }

        Ok(ready_set.ready)
    }

    /// Marks a step running and records its task.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn mark_step_running(&self, step_id: &str, task: Task) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.running.insert(step_id.to_string());
        inner.tasks.insert(step_id.to_string(), task);
        Ok(())
    }

    /// Marks a step completed and feeds its outputs into the template
    /// context for downstream steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn mark_step_completed(
        &self,
        step_id: &str,
        outputs: Option<Map<String, Value>>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.running.remove(step_id);
        inner.completed.insert(step_id.to_string());
        inner
            .context
            .add_step_result(step_id, outputs, TaskStatus::Succeeded.to_string());
        Ok(())
    }

    /// Marks a step failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn mark_step_failed(&self, step_id: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.running.remove(step_id);
        inner.failed.insert(step_id.to_string());
        inner
            .context
            .add_step_result(step_id, None, TaskStatus::Failed.to_string());
        Ok(())
    }

    /// Rebuilds the tracking sets from persisted tasks after a restart.
    ///
    /// SUCCEEDED tasks contribute outputs to the context, FAILED tasks
    /// contribute a FAILED status with no outputs, RUNNING tasks mark their
    /// step running, and QUEUED tasks are left for the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn restore_from_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        for task in tasks {
            let step_id = task.step_id.clone();
            match task.status {
                TaskStatus::Succeeded => {
                    inner.completed.insert(step_id.clone());
                    inner.context.add_step_result(
                        &step_id,
                        Some(task.outputs.clone()),
                        TaskStatus::Succeeded.to_string(),
                    );
                }
                TaskStatus::Failed => {
                    inner.failed.insert(step_id.clone());
                    inner
                        .context
                        .add_step_result(&step_id, None, TaskStatus::Failed.to_string());
                }
                TaskStatus::Running => {
                    inner.running.insert(step_id.clone());
                }
                TaskStatus::Queued => {}
            }
            inner.tasks.insert(step_id, task);
        }
        Ok(())
    }

    /// Renders using a clone of the current context.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn context_snapshot(&self) -> Result<Context> {
        Ok(self.inner.read().map_err(poison_err)?.context.clone())
    }

    /// Returns true when every executable node has completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn is_complete(&self) -> Result<bool> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(self
            .dag()
            .executable_nodes()
            .iter()
            .all(|node| inner.completed.contains(&node.id)))
    }

    /// Returns true when any step failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn has_failed(&self) -> Result<bool> {
        Ok(!self.inner.read().map_err(poison_err)?.failed.is_empty())
    }

    /// Returns the failed step ids, sorted for stable error messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn failed_steps(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut failed: Vec<String> = inner.failed.iter().cloned().collect();
        failed.sort();
        Ok(failed)
    }

    /// Returns the task recorded for a step, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn task_for_step(&self, step_id: &str) -> Result<Option<Task>> {
        Ok(self
            .inner
            .read()
            .map_err(poison_err)?
            .tasks
            .get(step_id)
            .cloned())
    }

    /// Returns a progress snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn stats(&self) -> Result<RunStats> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(RunStats {
            total_steps: self.dag().executable_nodes().len(),
            completed_steps: inner.completed.len(),
            running_steps: inner.running.len(),
            failed_steps: inner.failed.len(),
        })
    }

    /// Returns the `(completed, running, failed)` sets; test observability.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn progress_sets(
        &self,
    ) -> Result<(HashSet<String>, HashSet<String>, HashSet<String>)> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok((
            inner.completed.clone(),
            inner.running.clone(),
            inner.failed.clone(),
        ))
    }
}
