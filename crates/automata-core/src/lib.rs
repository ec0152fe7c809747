//! # automata-core
//!
//! Shared kernel for the Automata workflow-automation system.
//!
//! This crate holds the pieces every service binary needs before any domain
//! logic runs:
//!
//! - **Typed identifiers**: uuid-backed newtypes that prevent mixing up
//!   flows, runs, tasks and schedules at compile time
//! - **Observability**: one-call logging bootstrap with JSON or text output
//! - **Configuration**: environment-driven service settings with documented
//!   defaults
//!
//! Domain logic (flow specs, the DAG engine, orchestration) lives in
//! `automata-flow`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use id::{FlowId, RunId, ScheduleId, TaskId};
