//! Topic-based event bus with queue groups and at-least-once delivery.
//!
//! Subjects are dot-separated tokens (`context.ready`,
//! `conversation.<id>.message.new`). Subscriptions take a pattern where `*`
//! matches exactly one token and a trailing `>` matches one or more.
//!
//! Every subscriber in the same queue group competes for messages from one
//! shared queue, so each message reaches exactly one member of the group.
//! A plain `subscribe` is a queue group of one.
//!
//! Deliveries must be settled. `ack` finishes a message; `nak` (or dropping
//! the delivery unsettled) puts it back on the group's queue until it has
//! been attempted `max_deliver` times, after which it is discarded.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BusError;
use crate::event::Topic;

/// The publish/subscribe contract the pipeline runs on.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish raw bytes on a concrete subject (no wildcards).
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Receive every message matching `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;

    /// Join the load-balanced consumer group `group` on `pattern`.
    async fn queue_subscribe(&self, pattern: &str, group: &str) -> Result<Subscription, BusError>;
}

/// JSON helpers available on every bus.
#[async_trait]
pub trait EventBusExt {
    async fn publish_json<T: Serialize + Sync>(&self, subject: &str, value: &T) -> Result<(), BusError>;

    /// Publish a payload on its own topic.
    async fn emit<T: Topic + Serialize + Sync>(&self, value: &T) -> Result<(), BusError>;
}

#[async_trait]
impl<B: EventBus + ?Sized> EventBusExt for B {
    async fn publish_json<T: Serialize + Sync>(&self, subject: &str, value: &T) -> Result<(), BusError> {
        let payload = serde_json::to_vec(value).map_err(|e| BusError::PublishFailed {
            subject: subject.to_string(),
            reason: format!("encode: {e}"),
        })?;
        self.publish(subject, payload).await
    }

    async fn emit<T: Topic + Serialize + Sync>(&self, value: &T) -> Result<(), BusError> {
        self.publish_json(T::TOPIC, value).await
    }
}

/// A message waiting in a group queue.
#[derive(Debug, Clone)]
struct Queued {
    subject: String,
    payload: Arc<[u8]>,
    attempt: u32,
}

/// One message handed to one subscriber.
pub struct Delivery {
    subject: String,
    payload: Arc<[u8]>,
    attempt: u32,
    redeliver: Option<Redeliver>,
}

struct Redeliver {
    queue: mpsc::Sender<Queued>,
    max_deliver: u32,
}

impl Delivery {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// 1 on first delivery, incremented on each redelivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_slice(&self.payload).map_err(|e| BusError::Decode {
            subject: self.subject.clone(),
            reason: e.to_string(),
        })
    }

    /// Mark the message as handled.
    pub fn ack(mut self) {
        self.redeliver = None;
    }

    /// Hand the message back for redelivery.
    pub fn nak(mut self) {
        self.requeue();
    }

    fn requeue(&mut self) {
        let Some(redeliver) = self.redeliver.take() else {
            return;
        };
        if self.attempt >= redeliver.max_deliver {
            warn!(
                subject = %self.subject,
                attempts = self.attempt,
                "Max deliveries reached, discarding message"
            );
            return;
        }
        let next = Queued {
            subject: self.subject.clone(),
            payload: self.payload.clone(),
            attempt: self.attempt + 1,
        };
        if let Err(e) = redeliver.queue.try_send(next) {
            warn!(subject = %self.subject, error = %e, "Redelivery failed, message lost");
        } else {
            debug!(subject = %self.subject, attempt = self.attempt + 1, "Message requeued");
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        // Unsettled deliveries are redelivered.
        self.requeue();
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("attempt", &self.attempt)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

/// A handle on one group queue. Cloning it adds another competing consumer.
#[derive(Clone)]
pub struct Subscription {
    pattern: String,
    group: String,
    queue: Arc<Mutex<mpsc::Receiver<Queued>>>,
    requeue: mpsc::WeakSender<Queued>,
    max_deliver: u32,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Wait for the next message. Returns `None` once the bus is closed and
    /// the queue has drained.
    pub async fn next(&self) -> Option<Delivery> {
        let queued = self.queue.lock().await.recv().await?;
        let redeliver = self.requeue.upgrade().map(|queue| Redeliver {
            queue,
            max_deliver: self.max_deliver,
        });
        Some(Delivery {
            subject: queued.subject,
            payload: queued.payload,
            attempt: queued.attempt,
            redeliver,
        })
    }
}

struct Route {
    pattern: String,
    group: String,
    sender: mpsc::Sender<Queued>,
    receiver: Arc<Mutex<mpsc::Receiver<Queued>>>,
}

impl Route {
    /// Only the bus itself still holds the receiver.
    fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.receiver) == 1
    }
}

/// Bus implementation living inside one process, built on `tokio::sync::mpsc`.
pub struct InProcessBus {
    routes: RwLock<Vec<Route>>,
    capacity: usize,
    max_deliver: u32,
}

impl InProcessBus {
    /// Create a bus whose group queues hold `capacity` messages and which
    /// attempts each message at most `max_deliver` times.
    pub fn new(capacity: usize, max_deliver: u32) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
            max_deliver: max_deliver.max(1),
        }
    }

    /// Drop every route. Subscriptions drain what is queued, then end.
    pub async fn close(&self) {
        self.routes.write().await.clear();
    }

    async fn join(&self, pattern: &str, group: String) -> Result<Subscription, BusError> {
        validate_pattern(pattern)?;
        let mut routes = self.routes.write().await;
        routes.retain(|r| !r.is_abandoned());

        if let Some(route) = routes
            .iter()
            .find(|r| r.pattern == pattern && r.group == group)
        {
            return Ok(Subscription {
                pattern: pattern.to_string(),
                group,
                queue: route.receiver.clone(),
                requeue: route.sender.downgrade(),
                max_deliver: self.max_deliver,
            });
        }

        let (sender, receiver) = mpsc::channel(self.capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let sub = Subscription {
            pattern: pattern.to_string(),
            group: group.clone(),
            queue: receiver.clone(),
            requeue: sender.downgrade(),
            max_deliver: self.max_deliver,
        };
        routes.push(Route {
            pattern: pattern.to_string(),
            group,
            sender,
            receiver,
        });
        Ok(sub)
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(1024, 3)
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        validate_subject(subject)?;
        let payload: Arc<[u8]> = payload.into();

        let senders: Vec<mpsc::Sender<Queued>> = {
            let routes = self.routes.read().await;
            routes
                .iter()
                .filter(|r| !r.is_abandoned() && subject_matches(&r.pattern, subject))
                .map(|r| r.sender.clone())
                .collect()
        };

        if senders.is_empty() {
            debug!(subject, "Published with no subscribers");
        }

        for sender in senders {
            sender
                .send(Queued {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    attempt: 1,
                })
                .await
                .map_err(|_| BusError::Closed)?;
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        self.join(pattern, format!("_inbox.{}", Uuid::new_v4())).await
    }

    async fn queue_subscribe(&self, pattern: &str, group: &str) -> Result<Subscription, BusError> {
        if group.is_empty() {
            return Err(BusError::InvalidSubject {
                subject: pattern.to_string(),
                reason: "queue group name is empty".into(),
            });
        }
        self.join(pattern, group.to_string()).await
    }
}

/// Does `subject` match `pattern`?
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_subject(subject: &str) -> Result<(), BusError> {
    if subject.is_empty() || subject.split('.').any(|t| t.is_empty()) {
        return Err(BusError::InvalidSubject {
            subject: subject.to_string(),
            reason: "empty token".into(),
        });
    }
    if subject.split('.').any(|t| t == "*" || t == ">") {
        return Err(BusError::InvalidSubject {
            subject: subject.to_string(),
            reason: "wildcards are only valid in subscriptions".into(),
        });
    }
    Ok(())
}

fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    if pattern.is_empty() || tokens.iter().any(|t| t.is_empty()) {
        return Err(BusError::InvalidSubject {
            subject: pattern.to_string(),
            reason: "empty token".into(),
        });
    }
    if let Some(pos) = tokens.iter().position(|t| *t == ">") {
        if pos != tokens.len() - 1 {
            return Err(BusError::InvalidSubject {
                subject: pattern.to_string(),
                reason: "'>' must be the last token".into(),
            });
        }
    }
    Ok(())
}
