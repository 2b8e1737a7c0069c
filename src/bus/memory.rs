//! In-process broker.
//!
//! One unbounded queue per subscription, one consumer task per subscription,
//! so each subscription sees its messages strictly one at a time. Retries go
//! to the back of the queue; once `max_attempts` deliveries have failed the
//! message is dead-lettered into an [`InMemoryDeadLetterStore`].
//!
//! Also the test double for the relay: it records every publish and can be
//! told to fail them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    Broker, BrokerMessage, BusError, MessageHandler, Outcome, Result, SubscriptionHandle, Topology,
};
use crate::dlq::{DeadLetter, DeadLetterStore, InMemoryDeadLetterStore};

/// A queued delivery.
struct Envelope {
    publication: String,
    message: BrokerMessage,
    /// 1 on first delivery.
    attempt: u32,
}

struct Queue {
    sender: mpsc::UnboundedSender<Envelope>,
    /// Taken by the running consumer, handed back when it exits.
    receiver: Option<mpsc::UnboundedReceiver<Envelope>>,
}

/// In-process broker.
pub struct InMemoryBroker {
    topology: Topology,
    max_attempts: u32,
    queues: Arc<Mutex<HashMap<String, Queue>>>,
    published: RwLock<Vec<(String, BrokerMessage)>>,
    fail_on_publish: RwLock<bool>,
    dead_letters: Arc<InMemoryDeadLetterStore>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    shut_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl InMemoryBroker {
    pub fn new(topology: Topology, max_attempts: u32) -> Self {
        let queues = topology
            .streams()
            .iter()
            .map(|stream| {
                let (sender, receiver) = mpsc::unbounded_channel();
                (
                    stream.subscription.clone(),
                    Queue {
                        sender,
                        receiver: Some(receiver),
                    },
                )
            })
            .collect();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            topology,
            max_attempts: max_attempts.max(1),
            queues: Arc::new(Mutex::new(queues)),
            published: RwLock::new(Vec::new()),
            fail_on_publish: RwLock::new(false),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            shut_down: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Make every publish fail until reset, as if the broker were down.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Every accepted publish as `(publication, message)`, oldest first.
    pub async fn published(&self) -> Vec<(String, BrokerMessage)> {
        self.published.read().await.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<(String, BrokerMessage)> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub fn dead_letters(&self) -> Arc<InMemoryDeadLetterStore> {
        self.dead_letters.clone()
    }

    /// Messages published but not yet acked or dead-lettered.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every published message has been settled.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending() == 0;
            }
        }
    }
}

struct Consumer {
    subscription: String,
    routing_key: String,
    handler: Arc<dyn MessageHandler>,
    max_attempts: u32,
    requeue: mpsc::UnboundedSender<Envelope>,
    dead_letters: Arc<InMemoryDeadLetterStore>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Consumer {
    /// Deliver until stopped. On broker shutdown the queue is drained first.
    async fn run(
        self,
        mut receiver: mpsc::UnboundedReceiver<Envelope>,
        mut cancel: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        info!(subscription = %self.subscription, "Consumer started");
        let mut cancel_open = true;

        loop {
            tokio::select! {
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel.borrow() => {
                        info!(subscription = %self.subscription, "Consumer stopped");
                        return receiver;
                    }
                    Ok(()) => {}
                    // Handle dropped: keep consuming until broker shutdown.
                    Err(_) => cancel_open = false,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                envelope = receiver.recv() => match envelope {
                    Some(envelope) => self.process(envelope).await,
                    None => return receiver,
                },
            }
        }

        while let Ok(envelope) = receiver.try_recv() {
            self.process(envelope).await;
        }
        info!(subscription = %self.subscription, "Consumer drained and stopped");
        receiver
    }

    async fn process(&self, envelope: Envelope) {
        let delivery = envelope
            .message
            .clone()
            .with_delivery(self.routing_key.clone(), envelope.attempt - 1);

        match self.handler.handle(&delivery).await {
            Outcome::Ack => {
                debug!(
                    subscription = %self.subscription,
                    event_name = %delivery.event_name,
                    "Message acked"
                );
                self.settle();
            }
            Outcome::Retry(reason) if envelope.attempt < self.max_attempts => {
                warn!(
                    subscription = %self.subscription,
                    event_name = %delivery.event_name,
                    attempt = envelope.attempt,
                    reason = %reason,
                    "Handler asked for retry, requeueing"
                );
                let retry = Envelope {
                    attempt: envelope.attempt + 1,
                    ..envelope
                };
                if self.requeue.send(retry).is_err() {
                    error!(subscription = %self.subscription, "Queue closed, dropping retry");
                    self.settle();
                }
            }
            Outcome::Retry(reason) => {
                let reason = format!("gave up after {} attempts: {}", envelope.attempt, reason);
                self.dead_letter(envelope, reason).await;
            }
            Outcome::DeadLetter(reason) => {
                self.dead_letter(envelope, reason).await;
            }
        }
    }

    async fn dead_letter(&self, envelope: Envelope, reason: String) {
        self.dead_letters
            .record(DeadLetter::new(
                envelope.publication,
                self.subscription.clone(),
                envelope.message,
                reason,
                envelope.attempt,
            ))
            .await;
        self.settle();
    }

    fn settle(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn init(&self) -> Result<()> {
        self.topology.validate()?;
        self.shut_down.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(false);
        Ok(())
    }

    async fn start_subscription(
        &self,
        handler: Arc<dyn MessageHandler>,
        subscription: &str,
    ) -> Result<SubscriptionHandle> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::Shutdown);
        }
        let stream = self
            .topology
            .stream_for_subscription(subscription)
            .ok_or_else(|| BusError::UnknownSubscription(subscription.to_string()))?;

        let (requeue, receiver) = {
            let mut queues = self.queues.lock().await;
            let queue = queues
                .get_mut(subscription)
                .ok_or_else(|| BusError::UnknownSubscription(subscription.to_string()))?;
            let receiver = queue.receiver.take().ok_or_else(|| {
                BusError::Subscribe(format!("'{subscription}' already has a consumer"))
            })?;
            (queue.sender.clone(), receiver)
        };

        let consumer = Consumer {
            subscription: subscription.to_string(),
            routing_key: stream.routing_key.clone(),
            handler,
            max_attempts: self.max_attempts,
            requeue,
            dead_letters: self.dead_letters.clone(),
            pending: self.pending.clone(),
            idle: self.idle.clone(),
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let queues = self.queues.clone();
        let name = subscription.to_string();

        let task = tokio::spawn(async move {
            let receiver = consumer.run(receiver, cancel_rx, shutdown_rx).await;
            if let Some(queue) = queues.lock().await.get_mut(&name) {
                queue.receiver = Some(receiver);
            }
        });

        Ok(SubscriptionHandle::new(subscription, cancel_tx, task))
    }

    #[tracing::instrument(skip(self, message), fields(event_name = %message.event_name))]
    async fn publish(&self, message: &BrokerMessage, publication: &str) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::Shutdown);
        }
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("broker unavailable (simulated)".to_string()));
        }

        let stream = self
            .topology
            .stream_for_publication(publication)
            .ok_or_else(|| BusError::UnknownPublication(publication.to_string()))?;

        let queues = self.queues.lock().await;
        let queue = queues
            .get(&stream.subscription)
            .ok_or_else(|| BusError::UnknownPublication(publication.to_string()))?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            publication: publication.to_string(),
            message: BrokerMessage::new(message.event_name.clone(), message.event_payload.clone()),
            attempt: 1,
        };
        if queue.sender.send(envelope).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(BusError::Publish(format!("queue for '{publication}' is closed")));
        }
        drop(queues);

        self.published
            .write()
            .await
            .push((publication.to_string(), message.clone()));
        debug!(publication, "Message published");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.shutdown_tx.send_replace(true);
            info!("In-memory broker shut down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
