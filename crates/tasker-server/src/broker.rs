//! Message broker - named queues of task messages.
//!
//! Delivery is at-least-once: a received message stays in flight until it is
//! acknowledged, and becomes visible again if the visibility timeout elapses
//! first. Consumers must tolerate duplicates.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use tasker_core::TaskMessage;

use crate::config::Config;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// A received message, to be acknowledged once handled.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub message: TaskMessage,
    receipt: u64,
    redeliver_at: Instant,
}

impl Delivery {
    /// Instant at which the message becomes visible again unless acked.
    pub fn redeliver_at(&self) -> Instant {
        self.redeliver_at
    }
}

/// Queue transport between the dispatch router and workers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Make a message visible on `queue` now.
    async fn enqueue(&self, queue: &str, message: TaskMessage) -> Result<(), BrokerError>;

    /// Make a message visible on `queue` once `delay` has elapsed.
    async fn enqueue_after(
        &self,
        queue: &str,
        message: TaskMessage,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Wait for the next visible message on `queue`.
    async fn receive(&self, queue: &str) -> Result<Delivery, BrokerError>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Messages waiting on `queue`, visible or delayed.
    async fn depth(&self, queue: &str) -> Result<usize, BrokerError>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TaskMessage>,
    delayed: Vec<(Instant, TaskMessage)>,
    in_flight: HashMap<u64, (Instant, TaskMessage)>,
}

impl QueueState {
    /// Move due delayed messages and expired in-flight messages to ready.
    fn promote(&mut self, now: Instant) {
        if self.delayed.iter().any(|(at, _)| *at <= now) {
            self.delayed.sort_by_key(|(at, _)| *at);
            let split = self.delayed.partition_point(|(at, _)| *at <= now);
            for (_, message) in self.delayed.drain(..split) {
                self.ready.push_back(message);
            }
        }

        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some((_, message)) = self.in_flight.remove(&receipt) {
                debug!(task_id = %message.task_id, "Visibility timeout elapsed, redelivering");
                self.ready.push_back(message);
            }
        }
    }

    /// Earliest instant at which `promote` would have work to do.
    fn next_due(&self) -> Option<Instant> {
        self.delayed
            .iter()
            .map(|(at, _)| *at)
            .chain(self.in_flight.values().map(|(deadline, _)| *deadline))
            .min()
    }
}

struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// In-process broker over a fixed set of declared queues.
pub struct InMemoryBroker {
    queues: HashMap<String, Queue>,
    visibility_timeout: Duration,
    next_receipt: AtomicU64,
}

impl InMemoryBroker {
    /// Create a broker declaring `queues`.
    pub fn new<I, S>(queues: I, visibility_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queues = queues
            .into_iter()
            .map(|name| {
                (
                    name.into(),
                    Queue {
                        state: Mutex::new(QueueState::default()),
                        notify: Notify::new(),
                    },
                )
            })
            .collect();
        Self {
            queues,
            visibility_timeout,
            next_receipt: AtomicU64::new(1),
        }
    }

    /// Create a broker declaring every configured queue.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.queues.iter().map(|q| q.name.clone()),
            config.visibility_timeout,
        )
    }

    /// Messages delivered but not yet acknowledged.
    pub async fn in_flight(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self.queue(queue)?.state.lock().await.in_flight.len())
    }

    fn queue(&self, name: &str) -> Result<&Queue, BrokerError> {
        self.queues
            .get(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, queue: &str, message: TaskMessage) -> Result<(), BrokerError> {
        let q = self.queue(queue)?;
        q.state.lock().await.ready.push_back(message);
        q.notify.notify_one();
        Ok(())
    }

    async fn enqueue_after(
        &self,
        queue: &str,
        message: TaskMessage,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        if delay.is_zero() {
            return self.enqueue(queue, message).await;
        }
        let q = self.queue(queue)?;
        q.state
            .lock()
            .await
            .delayed
            .push((Instant::now() + delay, message));
        // Wake a waiter so it re-arms its timer for the new due time.
        q.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Delivery, BrokerError> {
        let q = self.queue(queue)?;

        loop {
            let notified = q.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = q.state.lock().await;
                let now = Instant::now();
                state.promote(now);

                if let Some(message) = state.ready.pop_front() {
                    let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed);
                    let redeliver_at = now + self.visibility_timeout;
                    state
                        .in_flight
                        .insert(receipt, (redeliver_at, message.clone()));
                    if !state.ready.is_empty() {
                        q.notify.notify_one();
                    }
                    return Ok(Delivery {
                        queue: queue.to_string(),
                        message,
                        receipt,
                        redeliver_at,
                    });
                }
                state.next_due()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let q = self.queue(&delivery.queue)?;
        if q.state.lock().await.in_flight.remove(&delivery.receipt).is_none() {
            debug!(
                task_id = %delivery.message.task_id,
                "Ack for a delivery that was already redelivered"
            );
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, BrokerError> {
        let state = self.queue(queue)?.state.lock().await;
        Ok(state.ready.len() + state.delayed.len())
    }
}
