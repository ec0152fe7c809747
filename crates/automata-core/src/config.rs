//! Environment-driven configuration for Automata services.
//!
//! Every service reads the same set of well-known variables; unknown or
//! absent values fall back to the documented defaults. Connection strings
//! are required only by the binaries that actually dial the backend, so
//! they stay `Option` here.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default HTTP port for the API service.
pub const DEFAULT_API_PORT: u16 = 8080;
/// Default HTTP port for the scheduler service.
pub const DEFAULT_SCHED_PORT: u16 = 8081;
/// Default HTTP port for the worker service.
pub const DEFAULT_WORKER_PORT: u16 = 8082;
/// Default HTTP port for the orchestrator service.
pub const DEFAULT_ORCH_PORT: u16 = 8083;

/// Advisory lock key gating the scheduler leader loop.
pub const SCHEDULER_LOCK_KEY: i64 = 424_242;

/// Settings shared by every Automata service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Relational store connection string (`DB_URL`).
    pub db_url: Option<String>,
    /// Broker connection string (`RABBITMQ_URL`).
    pub broker_url: Option<String>,
    /// API service port (`API_PORT`).
    pub api_port: u16,
    /// Scheduler service port (`SCHED_PORT`).
    pub sched_port: u16,
    /// Worker service port (`WORKER_PORT`).
    pub worker_port: u16,
    /// Orchestrator service port (`ORCH_PORT`).
    pub orch_port: u16,
    /// Orchestrator settings.
    pub orchestrator: OrchestratorConfig,
    /// Worker settings.
    pub worker: WorkerConfig,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
}

/// Orchestrator polling configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Fallback poll interval over pending runs.
    pub poll_interval: Duration,
    /// Pending runs fetched per poll.
    pub batch_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
        }
    }
}

/// Worker polling configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Fallback poll interval over queued tasks.
    pub poll_interval: Duration,
    /// Queued tasks fetched per poll.
    pub batch_size: usize,
    /// Broker prefetch for the task consumer.
    pub prefetch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 50,
            prefetch: 5,
        }
    }
}

/// Scheduler tick configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Due schedules processed per tick.
    pub batch_size: usize,
    /// Advisory lock key gating leadership.
    pub lock_key: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lock_key: SCHEDULER_LOCK_KEY,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_url: None,
            broker_url: None,
            api_port: DEFAULT_API_PORT,
            sched_port: DEFAULT_SCHED_PORT,
            worker_port: DEFAULT_WORKER_PORT,
            orch_port: DEFAULT_ORCH_PORT,
            orchestrator: OrchestratorConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a set variable fails to parse
    /// (absent variables fall back to defaults instead).
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        cfg.db_url = std::env::var("DB_URL").ok();
        cfg.broker_url = std::env::var("RABBITMQ_URL").ok();

        cfg.api_port = port_from_env("API_PORT", DEFAULT_API_PORT)?;
        cfg.sched_port = port_from_env("SCHED_PORT", DEFAULT_SCHED_PORT)?;
        cfg.worker_port = port_from_env("WORKER_PORT", DEFAULT_WORKER_PORT)?;
        cfg.orch_port = port_from_env("ORCH_PORT", DEFAULT_ORCH_PORT)?;

        if let Some(secs) = parse_from_env::<u64>("ORCH_POLL_INTERVAL_SEC")? {
            cfg.orchestrator.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_from_env::<usize>("ORCH_BATCH_SIZE")? {
            cfg.orchestrator.batch_size = n;
        }
        if let Some(secs) = parse_from_env::<u64>("WORKER_POLL_INTERVAL_SEC")? {
            cfg.worker.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_from_env::<usize>("WORKER_BATCH_SIZE")? {
            cfg.worker.batch_size = n;
        }
        if let Some(n) = parse_from_env::<usize>("WORKER_PREFETCH")? {
            cfg.worker.prefetch = n;
        }
        if let Some(n) = parse_from_env::<usize>("SCHED_BATCH_SIZE")? {
            cfg.scheduler.batch_size = n;
        }

        Ok(cfg)
    }
}

fn port_from_env(name: &str, default: u16) -> Result<u16> {
    Ok(parse_from_env::<u16>(name)?.unwrap_or(default))
}

fn parse_from_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            Error::configuration(format!("{name} has invalid value {raw:?}"))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.api_port, 8080);
        assert_eq!(cfg.sched_port, 8081);
        assert_eq!(cfg.worker_port, 8082);
        assert_eq!(cfg.orch_port, 8083);
        assert_eq!(cfg.orchestrator.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.orchestrator.batch_size, 100);
        assert_eq!(cfg.worker.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.worker.batch_size, 50);
        assert_eq!(cfg.worker.prefetch, 5);
        assert_eq!(cfg.scheduler.batch_size, 100);
        assert_eq!(cfg.scheduler.lock_key, 424_242);
    }
}
