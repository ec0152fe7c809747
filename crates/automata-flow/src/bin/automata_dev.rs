//! Single-process Automata development stack.
//!
//! Runs the scheduler leader loop, the orchestrator and a worker over a
//! shared in-memory store and broker, with `/healthz` and `/metrics` served
//! on the orchestrator port. Useful for demos, local flow authoring and
//! end-to-end smoke testing without Postgres or RabbitMQ.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use automata_core::config::ServiceConfig;
use automata_core::observability::init_logging_from_env;
use automata_flow::broker::memory::InMemoryBroker;
use automata_flow::broker::EventBus;
use automata_flow::error::{Error, Result};
use automata_flow::orchestrator::Orchestrator;
use automata_flow::scheduler::{LeaderLoop, Scheduler};
use automata_flow::store::memory::InMemoryStore;
use automata_flow::store::Store;
use automata_flow::worker::Worker;

/// Grace period for in-flight work after the shutdown signal.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging_from_env();

    let config = ServiceConfig::from_env()?;

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| Error::broker(format!("install metrics recorder: {err}")))?;

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBroker::new());

    let orchestrator = Orchestrator::new(store.clone(), bus.clone(), config.orchestrator.clone());
    let worker = Worker::new(store.clone(), bus.clone(), config.worker.clone());
    let scheduler = Scheduler::new(store.clone(), bus.clone(), config.scheduler.clone());
    let leader = LeaderLoop::new(store.clone(), scheduler);

    let cancel = CancellationToken::new();

    let app = Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(move || {
            let prometheus = prometheus.clone();
            async move { prometheus.render() }
        }));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.orch_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| Error::broker(format!("bind {addr}: {err}")))?;
    info!(%addr, "serving /healthz and /metrics");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(%err, "http server error");
        }
    });

    let services = {
        let cancel = cancel.clone();
        async move {
            tokio::join!(
                orchestrator.run(cancel.clone()),
                worker.run(cancel.clone()),
                leader.run(cancel.clone()),
            );
        }
    };
    let services = tokio::spawn(services);

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| Error::broker(format!("install signal handler: {err}")))?;
    info!("shutdown signal received");
    cancel.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, services).await.is_err() {
        error!("services did not stop within the grace period");
    }
    let _ = server.await;

    info!("automata dev stack stopped");
    Ok(())
}
