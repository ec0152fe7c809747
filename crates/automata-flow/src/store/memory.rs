//! In-memory store implementation.
//!
//! [`InMemoryStore`] backs tests and the single-process dev stack. It
//! enforces the same uniqueness constraints a relational backend would, so
//! idempotency behavior matches production.
//!
//! ## Limitations
//!
//! - **Single-process only**: state is not shared across process boundaries
//! - **No persistence**: all state is lost when the process exits

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use automata_core::{FlowId, RunId, ScheduleId, TaskId};

use super::Store;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowVersion};
use crate::run::{Run, RunStatus};
use crate::schedule::Schedule;
use crate::spec::FlowSpec;
use crate::task::{Task, TaskStatus};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

#[derive(Debug, Default)]
struct Inner {
    flows: HashMap<FlowId, Flow>,
    versions: HashMap<FlowId, Vec<FlowVersion>>,
    runs: HashMap<RunId, Run>,
    tasks: HashMap<TaskId, Task>,
    schedules: HashMap<ScheduleId, Schedule>,
    advisory_locks: HashSet<i64>,
}

/// In-memory store for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn run_count(&self) -> Result<usize> {
        Ok(self.inner.read().map_err(poison_err)?.runs.len())
    }

    /// Returns the number of stored tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_count(&self) -> Result<usize> {
        Ok(self.inner.read().map_err(poison_err)?.tasks.len())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !run.idempotency_key.is_empty() {
            let duplicate = inner.runs.values().any(|existing| {
                existing.flow_id == run.flow_id
                    && existing.idempotency_key == run.idempotency_key
            });
            if duplicate {
                return Err(Error::DuplicateIdempotencyKey {
                    key: run.idempotency_key.clone(),
                });
            }
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        Ok(self.inner.read().map_err(poison_err)?.runs.get(&run_id).cloned())
    }

    async fn get_run_by_idempotency_key(
        &self,
        flow_id: FlowId,
        key: &str,
    ) -> Result<Option<Run>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .runs
            .values()
            .find(|run| run.flow_id == flow_id && run.idempotency_key == key)
            .cloned())
    }

    async fn list_pending_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut pending: Vec<Run> = inner
            .runs
            .values()
            .filter(|run| run.status == RunStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|run| run.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !inner.runs.contains_key(&run.id) {
            return Err(Error::RunNotFound { run_id: run.id });
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let duplicate = inner
            .tasks
            .values()
            .any(|existing| existing.run_id == task.run_id && existing.step_id == task.step_id);
        if duplicate {
            return Err(Error::DuplicateTask {
                run_id: task.run_id,
                step_id: task.step_id.clone(),
            });
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        Ok(self.inner.read().map_err(poison_err)?.tasks.get(&task_id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !inner.tasks.contains_key(&task.id) {
            return Err(Error::TaskNotFound { task_id: task.id });
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn list_queued_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut queued: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|task| task.created_at);
        queued.truncate(limit);
        Ok(queued)
    }

    async fn list_tasks_by_run(&self, run_id: RunId) -> Result<Vec<Task>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| task.run_id == run_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }

    async fn create_flow(&self, flow: &Flow) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.flows.insert(flow.id, flow.clone());
        Ok(())
    }

    async fn get_flow(&self, flow_id: FlowId) -> Result<Option<Flow>> {
        Ok(self.inner.read().map_err(poison_err)?.flows.get(&flow_id).cloned())
    }

    async fn create_version(&self, flow_id: FlowId, spec: FlowSpec) -> Result<FlowVersion> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let versions = inner.versions.entry(flow_id).or_default();
        let next = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let version = FlowVersion {
            flow_id,
            version: next,
            spec,
            created_at: Utc::now(),
        };
        versions.push(version.clone());
        Ok(version)
    }

    async fn get_version(&self, flow_id: FlowId, version: i32) -> Result<Option<FlowVersion>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .versions
            .get(&flow_id)
            .and_then(|versions| versions.iter().find(|v| v.version == version))
            .cloned())
    }

    async fn get_latest_version(&self, flow_id: FlowId) -> Result<Option<FlowVersion>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .versions
            .get(&flow_id)
            .and_then(|versions| versions.iter().max_by_key(|v| v.version))
            .cloned())
    }

    async fn create_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Schedule>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut due: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|sched| sched.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|sched| sched.next_due_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn set_schedule_enabled(&self, schedule_id: ScheduleId, enabled: bool) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if let Some(schedule) = inner.schedules.get_mut(&schedule_id) {
            schedule.enabled = enabled;
            schedule.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        // Process-scoped semantics: the holder re-acquiring is fine, which
        // is how a single dev process models the database behavior.
        inner.advisory_locks.insert(key);
        Ok(true)
    }

    async fn release_advisory_lock(&self, key: i64) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        Ok(inner.advisory_locks.remove(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn pending_run(flow_id: FlowId) -> Run {
        Run::new(flow_id, 1, Map::new())
    }

    #[tokio::test]
    async fn idempotency_key_is_unique_per_flow() {
        let store = InMemoryStore::new();
        let flow_id = FlowId::generate();

        let first = pending_run(flow_id).with_idempotency_key("sched_1700000000");
        store.create_run(&first).await.unwrap();

        let duplicate = pending_run(flow_id).with_idempotency_key("sched_1700000000");
        let err = store.create_run(&duplicate).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateIdempotencyKey { .. }));

        // Same key under a different flow is fine.
        let other_flow = pending_run(FlowId::generate()).with_idempotency_key("sched_1700000000");
        store.create_run(&other_flow).await.unwrap();

        let found = store
            .get_run_by_idempotency_key(flow_id, "sched_1700000000")
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn one_task_per_run_step() {
        let store = InMemoryStore::new();
        let run_id = RunId::generate();

        let task = Task::new(run_id, "a", "", crate::spec::StepType::Http, Map::new());
        store.create_task(&task).await.unwrap();

        let twin = Task::new(run_id, "a", "", crate::spec::StepType::Http, Map::new());
        let err = store.create_task(&twin).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateTask { .. }));
    }

    #[tokio::test]
    async fn versions_are_assigned_contiguously() {
        let store = InMemoryStore::new();
        let flow_id = FlowId::generate();

        let v1 = store.create_version(flow_id, FlowSpec::default()).await.unwrap();
        let v2 = store.create_version(flow_id, FlowSpec::default()).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let latest = store.get_latest_version(flow_id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert!(store.get_version(flow_id, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_runs_are_oldest_first_and_capped() {
        let store = InMemoryStore::new();
        let flow_id = FlowId::generate();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut run = pending_run(flow_id);
            run.created_at = Utc::now();
            store.create_run(&run).await.unwrap();
            ids.push(run.id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let listed = store.list_pending_runs(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[0]);
        assert_eq!(listed[1].id, ids[1]);
    }

    #[tokio::test]
    async fn update_missing_run_is_not_found() {
        let store = InMemoryStore::new();
        let run = pending_run(FlowId::generate());
        let err = store.update_run(&run).await.unwrap_err();
        assert!(matches!(err, Error::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn due_schedules_filter_and_order() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut early = Schedule::interval(FlowId::generate(), 60);
        early.next_due_at = Some(now - chrono::Duration::seconds(120));
        store.create_schedule(&early).await.unwrap();

        let mut late = Schedule::interval(FlowId::generate(), 60);
        late.next_due_at = Some(now - chrono::Duration::seconds(30));
        store.create_schedule(&late).await.unwrap();

        let mut disabled = Schedule::interval(FlowId::generate(), 60);
        disabled.next_due_at = Some(now - chrono::Duration::seconds(300));
        disabled.enabled = false;
        store.create_schedule(&disabled).await.unwrap();

        let mut future = Schedule::interval(FlowId::generate(), 60);
        future.next_due_at = Some(now + chrono::Duration::seconds(60));
        store.create_schedule(&future).await.unwrap();

        let due = store.list_due_schedules(now, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, early.id);
        assert_eq!(due[1].id, late.id);
    }

    #[tokio::test]
    async fn advisory_lock_round_trip() {
        let store = InMemoryStore::new();
        assert!(store.try_advisory_lock(424_242).await.unwrap());
        assert!(store.try_advisory_lock(424_242).await.unwrap());
        assert!(store.release_advisory_lock(424_242).await.unwrap());
        assert!(!store.release_advisory_lock(424_242).await.unwrap());
    }
}
