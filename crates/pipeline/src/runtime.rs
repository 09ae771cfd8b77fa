//! Pipeline assembly: wires every stage onto one bus.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use turnflow_config::AppConfig;
use turnflow_core::bus::{EventBus, EventBusExt};
use turnflow_core::error::{Error, Result};
use turnflow_core::event::ContextRequest;
use turnflow_core::message::{ConversationId, Message};
use turnflow_core::provider::Provider;
use turnflow_core::store::{AppendOutcome, Store};
use turnflow_core::token::TokenCounter;
use turnflow_core::tool::ToolRegistry;
use turnflow_tools::{CachedCatalog, ToolRunner};

use crate::context::{ContextBuilder, ContextSettings};
use crate::inference::InferenceExecutor;
use crate::orchestrator::{FlowOrchestrator, OrchestratorSettings};
use crate::tool_runner::ToolRunnerStage;
use crate::worker::{Service, ServiceConfig};

/// Collaborators the pipeline runs against.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn EventBus>,
    pub provider: Arc<dyn Provider>,
    pub counter: Arc<dyn TokenCounter>,
    /// Tools offered to the model and, when the built-in runner is
    /// enabled, executed in-process.
    pub registry: ToolRegistry,
}

/// A running pipeline.
pub struct Pipeline {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Start the context builder, inference executor and flow orchestrator
    /// (plus the tool runner if `tools.run_builtin` is set).
    pub async fn start(config: &AppConfig, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            store,
            bus,
            provider,
            counter,
            registry,
        } = collaborators;
        let (shutdown, watcher) = watch::channel(false);
        let mut handles = Vec::new();

        let builder = ContextBuilder::new(
            store.clone(),
            bus.clone(),
            counter,
            ContextSettings::from(&config.context),
        );
        let service = ServiceConfig {
            workers: config.workers.context_builder,
            deadline: config.deadlines.context_builder(),
        };
        handles.extend(
            Service::new(Arc::new(builder), bus.clone(), service)
                .with_audit(store.clone())
                .spawn(watcher.clone())
                .await?,
        );

        let catalog = CachedCatalog::new(Arc::new(registry.clone()), config.tools.catalog_ttl());
        let executor = InferenceExecutor::new(store.clone(), bus.clone(), provider, Arc::new(catalog));
        let service = ServiceConfig {
            workers: config.workers.inference_executor,
            deadline: config.deadlines.inference_executor(),
        };
        handles.extend(
            Service::new(Arc::new(executor), bus.clone(), service)
                .with_audit(store.clone())
                .spawn(watcher.clone())
                .await?,
        );

        let orchestrator = FlowOrchestrator::new(store.clone(), bus.clone(), OrchestratorSettings::from(config));
        let service = ServiceConfig {
            workers: config.workers.flow_orchestrator,
            deadline: config.deadlines.flow_orchestrator(),
        };
        handles.extend(
            Service::new(Arc::new(orchestrator), bus.clone(), service)
                .with_audit(store.clone())
                .spawn(watcher.clone())
                .await?,
        );

        if config.tools.run_builtin {
            let runner = ToolRunner::new(registry, config.deadlines.tool_runner());
            let service = ServiceConfig {
                workers: config.workers.tool_runner,
                deadline: config.deadlines.tool_runner(),
            };
            handles.extend(
                Service::new(Arc::new(ToolRunnerStage::new(runner, bus.clone())), bus.clone(), service)
                    .with_audit(store)
                    .spawn(watcher)
                    .await?,
            );
        }

        info!(workers = handles.len(), "Pipeline started");
        Ok(Self { shutdown, handles })
    }

    /// Number of worker tasks.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Pipeline stopped");
    }
}

/// Store a user message, append it to its conversation and ask for a
/// context window.
pub async fn submit_user_message(
    store: &dyn Store,
    bus: &dyn EventBus,
    conversation_id: &ConversationId,
    content: impl Into<String>,
) -> Result<Message> {
    let message = Message::user(conversation_id, content);
    store.save_message(&message).await?;

    match store.append_message_id(conversation_id, &message.id).await? {
        AppendOutcome::MissingConversation => {
            return Err(Error::not_found("conversation", conversation_id.as_str()));
        }
        AppendOutcome::Appended | AppendOutcome::AlreadyPresent => {}
    }

    bus.emit(&ContextRequest::new(conversation_id, &message.id)).await?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::SequentialMockProvider;
    use std::time::Duration;
    use turnflow_core::bus::InProcessBus;
    use turnflow_core::error::ErrorKind;
    use turnflow_core::event::{CompletionNotification, topics};
    use turnflow_core::message::{Conversation, SystemPrompt};
    use turnflow_core::token::CharHeuristic;
    use turnflow_store::InMemoryStore;

    #[tokio::test]
    async fn submit_requires_conversation() {
        let store = InMemoryStore::new();
        let bus = InProcessBus::default();
        let err = submit_user_message(&store, &bus, &ConversationId::from("ghost"), "hi")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn one_turn_end_to_end() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InProcessBus::default());
        let prompt = SystemPrompt::new("default", "Be brief.");
        store.save_system_prompt(&prompt).await.unwrap();
        let conversation = Conversation::new(&prompt.id);
        store.save_conversation(&conversation).await.unwrap();

        let notifications = bus
            .subscribe(&topics::conversation_message_new(&conversation.id))
            .await
            .unwrap();

        let pipeline = Pipeline::start(
            &AppConfig::default(),
            Collaborators {
                store: store.clone(),
                bus: bus.clone(),
                provider: Arc::new(SequentialMockProvider::single_text("Hello!")),
                counter: Arc::new(CharHeuristic),
                registry: turnflow_tools::default_registry(),
            },
        )
        .await
        .unwrap();
        assert!(pipeline.worker_count() >= 5);

        let user = submit_user_message(store.as_ref(), bus.as_ref(), &conversation.id, "Hi")
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(5), notifications.next())
            .await
            .unwrap()
            .unwrap();
        let note: CompletionNotification = delivery.decode().unwrap();
        delivery.ack();
        assert_eq!(note.message.content, "Hello!");

        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.message_ids, vec![user.id, note.message.id]);

        pipeline.shutdown().await;
    }
}
