//! In-memory event bus implementation.
//!
//! Implements the declared topology with real ack/nack semantics: prefetch
//! limits outstanding deliveries, nack-with-requeue puts the message back at
//! the front of its queue, nack-without-requeue routes through the queue's
//! dead-letter binding. Tests and the single-process dev stack run on this.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    broker_err, EventBus, Exchange, Message, QueueName, RawDelivery, RoutingKey, Subscription,
};
use crate::error::{Error, Result};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    broker_err("broker lock poisoned")
}

/// One declared queue: backlog plus optional dead-letter target.
#[derive(Debug, Default)]
struct QueueState {
    backlog: VecDeque<Vec<u8>>,
    dead_letter: Option<(Exchange, RoutingKey)>,
}

#[derive(Debug)]
struct Inner {
    queues: Mutex<HashMap<&'static str, QueueState>>,
    bindings: Vec<(Exchange, RoutingKey, QueueName)>,
    notify: Notify,
    next_tag: AtomicU64,
}

/// In-memory broker for tests and local development.
///
/// The topology mirrors the production fabric exactly; only durability is
/// missing.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
    reconnect_tx: Arc<tokio::sync::watch::Sender<u64>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker with the Automata topology declared.
    #[must_use]
    pub fn new() -> Self {
        let mut queues = HashMap::new();
        queues.insert(QueueName::RunsPending.as_str(), QueueState::default());
        queues.insert(
            QueueName::TasksReady.as_str(),
            QueueState {
                backlog: VecDeque::new(),
                dead_letter: Some((Exchange::Dlq, RoutingKey::DlqTasks)),
            },
        );
        queues.insert(QueueName::TasksCompleted.as_str(), QueueState::default());
        queues.insert(QueueName::DlqTasks.as_str(), QueueState::default());

        let bindings = vec![
            (Exchange::Runs, RoutingKey::Pending, QueueName::RunsPending),
            (Exchange::Tasks, RoutingKey::Ready, QueueName::TasksReady),
            (
                Exchange::Tasks,
                RoutingKey::Completed,
                QueueName::TasksCompleted,
            ),
            (Exchange::Dlq, RoutingKey::DlqTasks, QueueName::DlqTasks),
        ];

        let (reconnect_tx, _) = tokio::sync::watch::channel(0_u64);

        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(queues),
                bindings,
                notify: Notify::new(),
                next_tag: AtomicU64::new(1),
            }),
            reconnect_tx: Arc::new(reconnect_tx),
        }
    }

    /// Injects raw bytes straight into a queue, bypassing the envelope.
    ///
    /// Test hook for exercising the malformed-message path.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn inject_raw(&self, queue: QueueName, body: Vec<u8>) -> Result<()> {
        let mut queues = self.inner.queues.lock().map_err(poison_err)?;
        queues
            .get_mut(queue.as_str())
            .ok_or_else(|| broker_err(format!("unknown queue: {}", queue.as_str())))?
            .backlog
            .push_back(body);
        drop(queues);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Returns the backlog depth of a queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn queue_depth(&self, queue: QueueName) -> Result<usize> {
        let queues = self.inner.queues.lock().map_err(poison_err)?;
        Ok(queues
            .get(queue.as_str())
            .map_or(0, |state| state.backlog.len()))
    }

    /// Signals consumers that the transport reconnected.
    ///
    /// Test hook; the real transport fires this from its reconnect loop.
    pub fn signal_reconnect(&self) {
        self.reconnect_tx.send_modify(|epoch| *epoch += 1);
    }

    fn route(&self, exchange: Exchange, routing_key: RoutingKey, body: &[u8]) -> Result<usize> {
        let targets: Vec<QueueName> = self
            .inner
            .bindings
            .iter()
            .filter(|(ex, key, _)| *ex == exchange && *key == routing_key)
            .map(|(_, _, queue)| *queue)
            .collect();

        if targets.is_empty() {
            return Err(broker_err(format!(
                "no binding for {}/{}",
                exchange.as_str(),
                routing_key.as_str()
            )));
        }

        let mut queues = self.inner.queues.lock().map_err(poison_err)?;
        for target in &targets {
            if let Some(state) = queues.get_mut(target.as_str()) {
                state.backlog.push_back(body.to_vec());
            }
        }
        drop(queues);
        self.inner.notify.notify_waiters();
        Ok(targets.len())
    }
}

#[async_trait]
impl EventBus for InMemoryBroker {
    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: RoutingKey,
        message: &Message,
    ) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        self.route(exchange, routing_key, &body)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: QueueName,
        prefetch: usize,
    ) -> Result<Box<dyn Subscription>> {
        {
            let queues = self.inner.queues.lock().map_err(poison_err)?;
            if !queues.contains_key(queue.as_str()) {
                return Err(broker_err(format!("unknown queue: {}", queue.as_str())));
            }
        }
        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            queue,
            prefetch: prefetch.max(1),
            unacked: HashMap::new(),
        }))
    }

    fn reconnect_notify(&self) -> tokio::sync::watch::Receiver<u64> {
        self.reconnect_tx.subscribe()
    }
}

struct MemorySubscription {
    broker: InMemoryBroker,
    queue: QueueName,
    prefetch: usize,
    unacked: HashMap<u64, Vec<u8>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<RawDelivery> {
        loop {
            // Register for wakeups before checking the backlog, so a publish
            // racing with the check cannot be missed.
            let notified = self.broker.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.unacked.len() < self.prefetch {
                let popped = {
                    let mut queues = self.broker.inner.queues.lock().map_err(poison_err)?;
                    queues
                        .get_mut(self.queue.as_str())
                        .and_then(|state| state.backlog.pop_front())
                };
                if let Some(body) = popped {
                    let tag = self.broker.inner.next_tag.fetch_add(1, Ordering::Relaxed);
                    self.unacked.insert(tag, body.clone());
                    return Ok(RawDelivery { body, tag });
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        self.unacked.remove(&tag);
        // Waking the waiters lets a prefetch-blocked peer continue.
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()> {
        let Some(body) = self.unacked.remove(&tag) else {
            return Ok(());
        };

        if requeue {
            let mut queues = self.broker.inner.queues.lock().map_err(poison_err)?;
            if let Some(state) = queues.get_mut(self.queue.as_str()) {
                state.backlog.push_front(body);
            }
        } else {
            let dead_letter = {
                let queues = self.broker.inner.queues.lock().map_err(poison_err)?;
                queues
                    .get(self.queue.as_str())
                    .and_then(|state| state.dead_letter)
            };
            if let Some((exchange, routing_key)) = dead_letter {
                self.broker.route(exchange, routing_key, &body)?;
            }
        }

        self.broker.inner.notify.notify_waiters();
        Ok(())
    }
}
