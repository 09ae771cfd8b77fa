//! Worker runtime shared by every stage.
//!
//! A [`Service`] subscribes a [`Stage`] to its subjects under one queue group
//! and runs N workers per subject. Each delivery is handled under the
//! stage's deadline and then settled:
//!
//! | Outcome | Action |
//! |---------|--------|
//! | handler `Ok` | ack |
//! | validation error | log, ack (dropped) |
//! | any other error, handler panic or deadline expiry | publish `system.error`, ack |
//! | `system.error` publish fails | nak (bus redelivers up to `max_deliver`) |

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use turnflow_core::bus::{Delivery, EventBus, EventBusExt, Subscription};
use turnflow_core::error::{Error, ErrorKind, Result};
use turnflow_core::event::{SystemErrorEvent, topics};
use turnflow_core::message::ConversationId;
use turnflow_core::store::{EventRecord, Store};

/// One pipeline stage: a named consumer of one or more subjects.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Stage name, also used as the queue group (e.g. "context-builder").
    fn name(&self) -> &'static str;

    /// Subjects this stage consumes.
    fn subjects(&self) -> &'static [&'static str];

    /// Handle one delivery.
    async fn handle(&self, subject: &str, payload: &[u8]) -> Result<()>;
}

/// Decode a JSON payload; failures are validation errors.
pub fn decode<T: DeserializeOwned>(subject: &str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::Validation(format!("malformed {subject} payload: {e}")))
}

/// Worker count and per-delivery deadline for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    pub workers: usize,
    pub deadline: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            deadline: Duration::from_secs(30),
        }
    }
}

/// Runs a [`Stage`] over the bus.
pub struct Service<S: Stage> {
    stage: Arc<S>,
    bus: Arc<dyn EventBus>,
    audit: Option<Arc<dyn Store>>,
    config: ServiceConfig,
}

impl<S: Stage> Service<S> {
    pub fn new(stage: Arc<S>, bus: Arc<dyn EventBus>, config: ServiceConfig) -> Self {
        Self {
            stage,
            bus,
            audit: None,
            config,
        }
    }

    /// Record published `system.error` events in this store's event log.
    pub fn with_audit(mut self, store: Arc<dyn Store>) -> Self {
        self.audit = Some(store);
        self
    }

    /// Subscribe and start the workers. They run until `shutdown` flips to
    /// `true` (or its sender is dropped) or the bus closes.
    pub async fn spawn(self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let service = Arc::new(self);
        let stage = service.stage.name();
        let workers = service.config.workers.max(1);
        let mut handles = Vec::new();

        for subject in service.stage.subjects() {
            let subscription = service.bus.queue_subscribe(subject, stage).await?;
            for worker in 0..workers {
                let service = service.clone();
                let subscription = subscription.clone();
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    service.run(worker, subscription, shutdown).await;
                }));
            }
        }

        info!(
            stage,
            subjects = ?service.stage.subjects(),
            workers,
            deadline_ms = service.config.deadline.as_millis() as u64,
            "Service started"
        );
        Ok(handles)
    }

    async fn run(&self, worker: usize, subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        let stage = self.stage.name();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                next = subscription.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.process(delivery).await;
        }
        debug!(stage, worker, subject = subscription.pattern(), "Worker stopped");
    }

    /// Handle and settle one delivery.
    pub async fn process(&self, delivery: Delivery) {
        let stage = self.stage.name();
        let started = Instant::now();

        // Own task per delivery: a panic surfaces here as a JoinError.
        let handler = self.stage.clone();
        let subject = delivery.subject().to_string();
        let payload = delivery.payload().to_vec();
        let mut task = tokio::spawn(async move { handler.handle(&subject, &payload).await });

        let err = match tokio::time::timeout(self.config.deadline, &mut task).await {
            Ok(Ok(Ok(()))) => {
                debug!(
                    stage,
                    subject = delivery.subject(),
                    attempt = delivery.attempt(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Delivery handled"
                );
                delivery.ack();
                return;
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(join)) => Error::Internal(format!("{stage} handler aborted: {join}")),
            Err(_) => {
                task.abort();
                Error::DeadlineExceeded {
                    stage: stage.to_string(),
                    after_ms: self.config.deadline.as_millis() as u64,
                }
            }
        };

        if err.kind() == ErrorKind::Validation {
            warn!(stage, subject = delivery.subject(), error = %err, "Dropping malformed delivery");
            delivery.ack();
            return;
        }

        let (conversation_id, message_id) = correlation(delivery.payload());
        error!(
            stage,
            subject = delivery.subject(),
            kind = %err.kind(),
            conversation_id = conversation_id.as_ref().map(|c| c.as_str()).unwrap_or("-"),
            message_id = message_id.as_deref().unwrap_or("-"),
            error = %err,
            "Stage failed"
        );

        let event = SystemErrorEvent::from_error(stage, &err).with_ids(conversation_id, message_id);
        match self.bus.emit(&event).await {
            Ok(()) => {
                self.record(&event).await;
                delivery.ack();
            }
            Err(e) => {
                error!(stage, error = %e, "Could not publish system.error; requesting redelivery");
                delivery.nak();
            }
        }
    }

    async fn record(&self, event: &SystemErrorEvent) {
        let Some(store) = &self.audit else {
            return;
        };
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Could not encode audit record");
                return;
            }
        };
        let mut record = EventRecord::new(topics::SYSTEM_ERROR, payload);
        record.conversation_id = event.conversation_id.clone();
        record.message_id = event.message_id.clone();
        if let Err(e) = store.append_event(record).await {
            warn!(error = %e, "Could not append audit record");
        }
    }
}

/// The ids every turn payload carries at its top level.
#[derive(Deserialize)]
struct Correlation {
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    #[serde(default)]
    message_id: Option<String>,
}

fn correlation(payload: &[u8]) -> (Option<ConversationId>, Option<String>) {
    serde_json::from_slice::<Correlation>(payload)
        .map(|c| (c.conversation_id, c.message_id))
        .unwrap_or((None, None))
}
