//! Event-bus facade for control-plane messaging.
//!
//! Every control transition is published here AND discoverable by polling
//! the store, so the bus only has to be fast, not perfectly reliable: lost
//! events are caught up by the polling loops.
//!
//! ## Topology
//!
//! ```text
//! automata.runs  (direct)
//! └── runs.pending      [routing: pending]     consumer: orchestrator
//!
//! automata.tasks (direct)
//! ├── tasks.ready       [routing: ready]       consumer: worker, DLQ: dlq.tasks
//! └── tasks.completed   [routing: completed]   consumer: orchestrator
//!
//! automata.dlq   (direct)
//! └── dlq.tasks         [routing: tasks]       manual processing
//! ```
//!
//! The [`EventBus`] trait keeps the transport pluggable: an AMQP
//! implementation in production, [`memory::InMemoryBroker`] for tests and
//! the single-process dev stack. Consumers re-subscribe after a
//! [`EventBus::reconnect_notify`] signal using [`reconnect_backoff`].

pub mod consumer;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use automata_core::{RunId, TaskId};

use crate::error::{Error, Result};
use crate::task::TaskStatus;

pub use consumer::{Consumer, ConsumerConfig, MessageHandler};

/// Exchange names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    /// Run lifecycle events.
    Runs,
    /// Task lifecycle events.
    Tasks,
    /// Dead-letter destination.
    Dlq,
}

impl Exchange {
    /// Returns the wire name of the exchange.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Runs => "automata.runs",
            Self::Tasks => "automata.tasks",
            Self::Dlq => "automata.dlq",
        }
    }
}

/// Queue names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// New runs awaiting an orchestrator.
    RunsPending,
    /// Tasks awaiting a worker.
    TasksReady,
    /// Task completions for the orchestrator.
    TasksCompleted,
    /// Unprocessable task messages.
    DlqTasks,
}

impl QueueName {
    /// Returns the wire name of the queue.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RunsPending => "runs.pending",
            Self::TasksReady => "tasks.ready",
            Self::TasksCompleted => "tasks.completed",
            Self::DlqTasks => "dlq.tasks",
        }
    }
}

/// Routing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    /// `pending` on the runs exchange.
    Pending,
    /// `ready` on the tasks exchange.
    Ready,
    /// `completed` on the tasks exchange.
    Completed,
    /// `tasks` on the DLQ exchange.
    DlqTasks,
}

impl RoutingKey {
    /// Returns the wire form of the routing key.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Completed => "completed",
            Self::DlqTasks => "tasks",
        }
    }
}

/// The kind of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A run was created and awaits an orchestrator.
    #[serde(rename = "run.pending")]
    RunPending,
    /// A task was persisted QUEUED and awaits a worker.
    #[serde(rename = "task.ready")]
    TaskReady,
    /// A task reached SUCCEEDED or FAILED.
    #[serde(rename = "task.completed")]
    TaskCompleted,
}

/// The JSON envelope carried on every queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: String,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Kind-specific payload.
    pub payload: Value,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates an envelope around a payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    pub fn new<P: Serialize>(kind: EventKind, payload: &P) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now(),
        })
    }

    /// Decodes the payload into its concrete type.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the payload does not match.
    pub fn parse_payload<P: for<'de> Deserialize<'de>>(&self) -> Result<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Payload of `run.pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunPendingPayload {
    /// The new run.
    pub run_id: RunId,
}

/// Payload of `task.ready`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskReadyPayload {
    /// The queued task.
    pub task_id: TaskId,
    /// The owning run.
    pub run_id: RunId,
}

/// Payload of `task.completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletedPayload {
    /// The finished task.
    pub task_id: TaskId,
    /// The owning run.
    pub run_id: RunId,
    /// The DAG node the task executed.
    pub step_id: String,
    /// Terminal status: SUCCEEDED or FAILED.
    pub status: TaskStatus,
    /// Error text for failures.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// The attempt that produced the outcome.
    pub attempt: u32,
}

/// A message delivered to a subscription, identified by its delivery tag.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    /// Raw message body (JSON).
    pub body: Vec<u8>,
    /// Tag used to ack or nack this delivery.
    pub tag: u64,
}

/// An open subscription on one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery.
    ///
    /// Respects the subscription's prefetch: no more than `prefetch`
    /// deliveries are outstanding (unacked) at a time.
    async fn recv(&mut self) -> Result<RawDelivery>;

    /// Acknowledges a delivery.
    async fn ack(&mut self, tag: u64) -> Result<()>;

    /// Rejects a delivery.
    ///
    /// With `requeue`, the message returns to the front of its queue for
    /// redelivery; without, it is routed to the queue's dead-letter binding
    /// (or dropped when none is configured).
    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()>;
}

/// Pluggable transport for control-plane events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a message to an exchange with a routing key.
    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: RoutingKey,
        message: &Message,
    ) -> Result<()>;

    /// Opens a subscription on a queue with the given prefetch.
    async fn subscribe(&self, queue: QueueName, prefetch: usize)
        -> Result<Box<dyn Subscription>>;

    /// Returns a receiver signalled after each transport reconnect, so
    /// consumers can reopen their subscriptions.
    fn reconnect_notify(&self) -> tokio::sync::watch::Receiver<u64>;
}

/// Publishes the well-known control events.
///
/// Publish failures are the caller's to downgrade: every publication has a
/// polling fallback, so a lost event delays work instead of losing it.
pub struct Publisher {
    bus: std::sync::Arc<dyn EventBus>,
}

impl Publisher {
    /// Creates a publisher over a bus.
    #[must_use]
    pub fn new(bus: std::sync::Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    /// Publishes `run.pending` on the runs exchange.
    ///
    /// # Errors
    ///
    /// Returns a broker error when the transport rejects the publish.
    pub async fn publish_run_pending(&self, run_id: RunId) -> Result<()> {
        let message = Message::new(EventKind::RunPending, &RunPendingPayload { run_id })?;
        self.bus
            .publish(Exchange::Runs, RoutingKey::Pending, &message)
            .await?;
        crate::metrics::FlowMetrics::record_message_published("run.pending");
        Ok(())
    }

    /// Publishes `task.ready` on the tasks exchange.
    ///
    /// # Errors
    ///
    /// Returns a broker error when the transport rejects the publish.
    pub async fn publish_task_ready(&self, task_id: TaskId, run_id: RunId) -> Result<()> {
        let message = Message::new(EventKind::TaskReady, &TaskReadyPayload { task_id, run_id })?;
        self.bus
            .publish(Exchange::Tasks, RoutingKey::Ready, &message)
            .await?;
        crate::metrics::FlowMetrics::record_message_published("task.ready");
        Ok(())
    }

    /// Publishes `task.completed` on the tasks exchange.
    ///
    /// # Errors
    ///
    /// Returns a broker error when the transport rejects the publish.
    pub async fn publish_task_completed(&self, payload: TaskCompletedPayload) -> Result<()> {
        let message = Message::new(EventKind::TaskCompleted, &payload)?;
        self.bus
            .publish(Exchange::Tasks, RoutingKey::Completed, &message)
            .await?;
        crate::metrics::FlowMetrics::record_message_published("task.completed");
        Ok(())
    }
}

/// Backoff for transport reconnect attempts: 1s doubling, capped at 30s.
#[must_use]
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let capped = attempt.min(5); // 1 << 5 = 32s, already past the cap
    Duration::from_secs((1_u64 << capped).min(30))
}

/// Maps a broker transport failure into the domain error.
pub(crate) fn broker_err(message: impl Into<String>) -> Error {
    Error::broker(message)
}
