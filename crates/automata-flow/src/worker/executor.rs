//! Executor contract and registry.
//!
//! An [`Executor`] runs one attempt of a task. The error channel is split
//! in two:
//!
//! - `Err(_)` is an **infrastructure** failure (network down, timeout) —
//!   always retriable
//! - `ExecutionResult::error` is a **logical** failure (HTTP >= 400) — the
//!   outputs are still meaningful, and the retry policy's `on_status` list
//!   decides retriability

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::task::Task;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("executor registry lock poisoned")
}

/// Result of one execution attempt.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Outputs of the attempt, fed back into the run's template context.
    pub outputs: Map<String, Value>,
    /// Logical error produced by the step (e.g. `"HTTP 503: ..."`), with
    /// outputs still populated.
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A successful result with outputs.
    #[must_use]
    pub fn success(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            error: None,
        }
    }

    /// Returns true when the attempt produced no logical error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes one attempt of a task.
///
/// `task.payload` holds the step config, already rendered by the
/// orchestrator at dispatch time.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs one attempt. `cancel` is tripped on worker shutdown; blocking
    /// executors must honor it.
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<ExecutionResult>;
}

/// Concurrency-safe mapping from step type to executor.
///
/// Read-mostly: registration happens at startup, lookups on every attempt.
pub struct Registry {
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates a registry with the default executors registered: `http`,
    /// `delay`, `transform`.
    ///
    /// `parallel` has no executor on purpose: the orchestrator resolves
    /// parallel start and join nodes, so the worker never sees them.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            executors: RwLock::new(HashMap::new()),
        };
        registry.register("http", Arc::new(super::http::HttpExecutor::new()));
        registry.register("delay", Arc::new(super::delay::DelayExecutor));
        registry.register("transform", Arc::new(super::transform::TransformExecutor));
        registry
    }

    /// Registers (or replaces) the executor for a step type.
    pub fn register(&self, step_type: impl Into<String>, executor: Arc<dyn Executor>) {
        if let Ok(mut executors) = self.executors.write() {
            executors.insert(step_type.into(), executor);
        }
    }

    /// Returns the executor for a step type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownStepType`] when no executor is registered.
    pub fn get(&self, step_type: &str) -> Result<Arc<dyn Executor>> {
        let executors = self.executors.read().map_err(poison_err)?;
        executors
            .get(step_type)
            .cloned()
            .ok_or_else(|| Error::UnknownStepType {
                step_type: step_type.to_string(),
            })
    }
}

/// Reads a string field from a payload with a default.
#[must_use]
pub(crate) fn payload_str<'a>(
    payload: &'a Map<String, Value>,
    key: &str,
    default: &'a str,
) -> &'a str {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
}

/// Reads a numeric field accepting both float and int representations.
#[must_use]
pub(crate) fn payload_f64(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

/// Reads a boolean field with a default.
#[must_use]
pub(crate) fn payload_bool(payload: &Map<String, Value>, key: &str, default: bool) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(default)
}
