//! Shared fixtures for the integration suites.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use automata_core::config::{OrchestratorConfig, WorkerConfig};
use automata_core::{FlowId, RunId};
use automata_flow::broker::memory::InMemoryBroker;
use automata_flow::broker::EventBus;
use automata_flow::flow::FlowVersion;
use automata_flow::orchestrator::Orchestrator;
use automata_flow::run::{Run, RunStatus};
use automata_flow::spec::{Branch, FlowSpec, StepDef, StepType};
use automata_flow::store::memory::InMemoryStore;
use automata_flow::store::Store;
use automata_flow::worker::Worker;

/// Everything a coordination test needs.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub bus: Arc<InMemoryBroker>,
    pub orchestrator: Arc<Orchestrator>,
    pub worker: Arc<Worker>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBroker::new());

        let store_dyn: Arc<dyn Store> = store.clone();
        let bus_dyn: Arc<dyn EventBus> = bus.clone();

        // Short poll intervals keep catch-up paths fast in tests.
        let orchestrator = Orchestrator::new(
            store_dyn.clone(),
            bus_dyn.clone(),
            OrchestratorConfig {
                poll_interval: Duration::from_millis(100),
                batch_size: 100,
            },
        );
        let worker = Worker::new(
            store_dyn,
            bus_dyn,
            WorkerConfig {
                poll_interval: Duration::from_millis(100),
                batch_size: 50,
                prefetch: 5,
            },
        );

        Self {
            store,
            bus,
            orchestrator,
            worker,
        }
    }

    /// Creates fresh orchestrator and worker instances over an existing
    /// harness's store and broker, modeling a service restart.
    pub fn new_with_backends(other: &Harness) -> Self {
        let store = other.store.clone();
        let bus = other.bus.clone();

        let store_dyn: Arc<dyn Store> = store.clone();
        let bus_dyn: Arc<dyn EventBus> = bus.clone();

        let orchestrator = Orchestrator::new(
            store_dyn.clone(),
            bus_dyn.clone(),
            OrchestratorConfig {
                poll_interval: Duration::from_millis(100),
                batch_size: 100,
            },
        );
        let worker = Worker::new(
            store_dyn,
            bus_dyn,
            WorkerConfig {
                poll_interval: Duration::from_millis(100),
                batch_size: 50,
                prefetch: 5,
            },
        );

        Self {
            store,
            bus,
            orchestrator,
            worker,
        }
    }

    /// Stores a flow version and returns it.
    pub async fn store_version(&self, spec: FlowSpec) -> FlowVersion {
        let flow_id = FlowId::generate();
        self.store
            .create_version(flow_id, spec)
            .await
            .expect("create version")
    }

    /// Creates a PENDING run for a version.
    pub async fn create_run(&self, version: &FlowVersion, inputs: Map<String, Value>) -> Run {
        let run = Run::new(version.flow_id, version.version, inputs);
        self.store.create_run(&run).await.expect("create run");
        run
    }

    /// Polls the store until the run reaches a terminal status.
    pub async fn await_terminal(&self, run_id: RunId, timeout: Duration) -> Run {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self
                .store
                .get_run(run_id)
                .await
                .expect("get run")
                .expect("run exists");
            if run.is_terminal() {
                return run;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} did not reach a terminal status (status: {:?})",
                run.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Builds a step definition.
pub fn step(id: &str, step_type: StepType, depends_on: &[&str]) -> StepDef {
    StepDef {
        id: id.to_string(),
        name: String::new(),
        step_type,
        depends_on: depends_on.iter().map(ToString::to_string).collect(),
        condition: String::new(),
        config: Map::new(),
        outputs: Map::new(),
        retry: None,
        timeout_sec: None,
        branches: Vec::new(),
    }
}

/// Builds a step with a config map.
pub fn step_with_config(
    id: &str,
    step_type: StepType,
    depends_on: &[&str],
    config: Value,
) -> StepDef {
    let mut s = step(id, step_type, depends_on);
    s.config = config.as_object().cloned().unwrap_or_default();
    s
}

/// Builds a parallel step from `(branch_id, steps)` pairs.
pub fn parallel(id: &str, depends_on: &[&str], branches: Vec<(&str, Vec<StepDef>)>) -> StepDef {
    let mut s = step(id, StepType::Parallel, depends_on);
    s.branches = branches
        .into_iter()
        .map(|(branch_id, steps)| Branch {
            id: branch_id.to_string(),
            steps,
        })
        .collect();
    s
}

/// Builds a spec from steps.
pub fn spec(steps: Vec<StepDef>) -> FlowSpec {
    FlowSpec {
        steps,
        ..FlowSpec::default()
    }
}

/// Asserts a run finished with the given status.
pub fn assert_status(run: &Run, status: RunStatus) {
    assert_eq!(
        run.status, status,
        "run {} has status {} (error: {:?})",
        run.id, run.status, run.error
    );
}
