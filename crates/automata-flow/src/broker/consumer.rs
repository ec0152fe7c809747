//! Queue consumer: the handler loop shared by the orchestrator and worker.
//!
//! Acknowledgement protocol:
//! - handler succeeds → ack
//! - message fails to decode → nack without requeue, so the DLQ (when bound)
//!   captures it instead of poisoning the queue
//! - handler fails → nack with requeue, so a redelivery retries after the
//!   underlying condition clears

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{reconnect_backoff, EventBus, Message, QueueName, Subscription};
use crate::error::Result;
use crate::metrics::FlowMetrics;

/// Handles decoded messages from one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message. An error triggers nack-with-requeue.
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Consumer configuration.
pub struct ConsumerConfig {
    /// The queue to consume.
    pub queue: QueueName,
    /// Maximum outstanding unacked deliveries.
    pub prefetch: usize,
    /// The message handler.
    pub handler: Arc<dyn MessageHandler>,
}

/// Drives a [`MessageHandler`] over a queue subscription.
pub struct Consumer {
    bus: Arc<dyn EventBus>,
    config: ConsumerConfig,
}

impl Consumer {
    /// Creates a consumer over a bus.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, config: ConsumerConfig) -> Self {
        Self { bus, config }
    }

    /// Runs the consume loop until cancelled.
    ///
    /// Subscription failures wait for a reconnect signal (with backoff) and
    /// resubscribe; the loop only exits on cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        let queue = self.config.queue.as_str();
        let mut reconnects = self.bus.reconnect_notify();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut subscription = match self
                .bus
                .subscribe(self.config.queue, self.config.prefetch)
                .await
            {
                Ok(subscription) => {
                    attempt = 0;
                    subscription
                }
                Err(err) => {
                    let delay = reconnect_backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    error!(queue, %err, ?delay, "failed to subscribe, waiting for reconnect");
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        _ = reconnects.changed() => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            info!(queue, "consumer started");

            loop {
                let delivery = tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = reconnects.changed() => {
                        info!(queue, "transport reconnected, reopening subscription");
                        break;
                    }
                    delivery = subscription.recv() => delivery,
                };

                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        warn!(queue, %err, "subscription closed, resubscribing");
                        break;
                    }
                };

                self.dispatch(queue, subscription.as_mut(), delivery).await;
            }
        }
    }

    async fn dispatch(
        &self,
        queue: &'static str,
        subscription: &mut dyn Subscription,
        delivery: super::RawDelivery,
    ) {
        let message: Message = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(err) => {
                error!(queue, %err, "failed to decode message, dead-lettering");
                FlowMetrics::record_dead_letter(queue);
                if let Err(nack_err) = subscription.nack(delivery.tag, false).await {
                    warn!(queue, %nack_err, "nack failed");
                }
                return;
            }
        };

        debug!(queue, message_id = %message.id, kind = ?message.kind, "received message");
        FlowMetrics::record_message_consumed(queue);

        match self.config.handler.handle(message).await {
            Ok(()) => {
                if let Err(err) = subscription.ack(delivery.tag).await {
                    warn!(queue, %err, "ack failed");
                }
            }
            Err(err) => {
                error!(queue, %err, "handler failed, requeueing message");
                FlowMetrics::record_handler_error(queue);
                if let Err(nack_err) = subscription.nack(delivery.tag, true).await {
                    warn!(queue, %nack_err, "nack failed");
                }
            }
        }
    }
}
