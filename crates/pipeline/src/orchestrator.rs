//! Flow Orchestrator — picks inference parameters for a ready context and
//! announces finished turns.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use turnflow_config::AppConfig;
use turnflow_core::bus::{EventBus, EventBusExt};
use turnflow_core::error::{Error, Result};
use turnflow_core::event::{
    CompletionNotification, ContextEnvelope, InferenceEnvelope, InferenceResponse, topics,
};
use turnflow_core::store::{AppendOutcome, EventRecord, Store};

use crate::worker::{Stage, decode};

/// Response token ceiling for a context of `context_tokens`: the headroom
/// left under `max_tokens`, clamped to `[floor, ceiling]`.
pub fn response_ceiling(max_tokens: u32, context_tokens: u32, floor: u32, ceiling: u32) -> u32 {
    max_tokens
        .saturating_sub(context_tokens)
        .max(floor)
        .min(ceiling)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub default_model: String,
    pub temperature: f32,
    /// Total token allowance shared by context and response.
    pub max_tokens: u32,
    pub min_response_tokens: u32,
    pub max_response_tokens: u32,
    pub tools_enabled: bool,
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(c: &AppConfig) -> Self {
        Self {
            default_model: c.default_model.clone(),
            temperature: c.default_temperature,
            max_tokens: c.max_tokens,
            min_response_tokens: c.inference.min_response_tokens,
            max_response_tokens: c.inference.max_response_tokens,
            tools_enabled: c.inference.tools_enabled,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        (&AppConfig::default()).into()
    }
}

pub struct FlowOrchestrator {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    settings: OrchestratorSettings,
}

impl FlowOrchestrator {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn EventBus>, settings: OrchestratorSettings) -> Self {
        Self { store, bus, settings }
    }

    /// Attach model, temperature and response ceiling to a ready context.
    pub async fn plan(&self, context: ContextEnvelope) -> Result<InferenceEnvelope> {
        let conversation = self
            .store
            .get_conversation(&context.conversation_id)
            .await?
            .ok_or_else(|| Error::not_found("conversation", context.conversation_id.as_str()))?;

        let model = conversation
            .model
            .unwrap_or_else(|| self.settings.default_model.clone());
        let max_tokens = response_ceiling(
            self.settings.max_tokens,
            context.total_tokens,
            self.settings.min_response_tokens,
            self.settings.max_response_tokens,
        );

        debug!(
            conversation_id = %context.conversation_id,
            %model,
            context_tokens = context.total_tokens,
            max_tokens,
            "Inference planned"
        );

        Ok(InferenceEnvelope {
            context,
            model,
            max_tokens,
            temperature: self.settings.temperature,
            tools_enabled: self.settings.tools_enabled,
        })
    }

    /// Record the assistant reply in the conversation and build the
    /// completion notification. Store failures here are logged only.
    pub async fn complete(&self, response: &InferenceResponse) -> CompletionNotification {
        let conversation_id = &response.conversation_id;
        match self
            .store
            .append_message_id(conversation_id, &response.message.id)
            .await
        {
            Ok(AppendOutcome::Appended) => {}
            Ok(AppendOutcome::AlreadyPresent) => {
                debug!(%conversation_id, message_id = %response.message.id, "Reply already appended");
            }
            Ok(AppendOutcome::MissingConversation) => {
                warn!(%conversation_id, "Conversation vanished before reply could be appended");
            }
            Err(e) => {
                warn!(%conversation_id, error = %e, "Failed to append reply to conversation");
            }
        }

        let duration_ms = (Utc::now() - response.requested_at)
            .num_milliseconds()
            .max(0) as u64;

        CompletionNotification {
            conversation_id: conversation_id.clone(),
            message: response.message.clone(),
            finish_reason: response.finish_reason,
            duration_ms,
            usage: response.usage,
        }
    }

    async fn audit(&self, notification: &CompletionNotification, trigger: &str) {
        let payload = serde_json::json!({
            "message_id": notification.message.id,
            "finish_reason": notification.finish_reason,
            "duration_ms": notification.duration_ms,
            "usage": notification.usage,
        });
        let record = EventRecord::new(topics::INFERENCE_RESPONSE, payload)
            .for_turn(&notification.conversation_id, trigger);
        if let Err(e) = self.store.append_event(record).await {
            warn!(conversation_id = %notification.conversation_id, error = %e, "Failed to write audit record");
        }
    }
}

#[async_trait]
impl Stage for FlowOrchestrator {
    fn name(&self) -> &'static str {
        "flow-orchestrator"
    }

    fn subjects(&self) -> &'static [&'static str] {
        &[topics::CONTEXT_READY, topics::INFERENCE_RESPONSE]
    }

    async fn handle(&self, subject: &str, payload: &[u8]) -> Result<()> {
        if subject == topics::CONTEXT_READY {
            let context: ContextEnvelope = decode(subject, payload)?;
            let envelope = self.plan(context).await?;
            self.bus.emit(&envelope).await?;
            return Ok(());
        }

        let response: InferenceResponse = decode(subject, payload)?;
        let notification = self.complete(&response).await;
        let subject = topics::conversation_message_new(&response.conversation_id);
        self.bus.publish_json(&subject, &notification).await?;
        self.audit(&notification, &response.message_id).await;

        info!(
            conversation_id = %notification.conversation_id,
            message_id = %notification.message.id,
            duration_ms = notification.duration_ms,
            total_tokens = notification.usage.total_tokens,
            "Turn complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnflow_core::bus::InProcessBus;
    use turnflow_core::error::ErrorKind;
    use turnflow_core::event::ContextMetadata;
    use turnflow_core::message::{Conversation, ConversationId, Message};
    use turnflow_core::provider::{FinishReason, Usage};
    use turnflow_store::InMemoryStore;

    #[test]
    fn response_ceiling_stays_in_bounds() {
        for headroom in [0u32, 511, 512, 2048, 5000] {
            let ceiling = response_ceiling(8192, 8192 - headroom, 512, 2048);
            assert!((512..=2048).contains(&ceiling), "headroom {headroom}");
        }
        assert_eq!(response_ceiling(8192, 8192 - 1000, 512, 2048), 1000);
        assert_eq!(response_ceiling(100, 5000, 512, 2048), 512);
    }

    #[test]
    fn crowded_context_gets_the_floor() {
        assert_eq!(response_ceiling(4096, 3900, 512, 2048), 512);
    }

    fn context(conversation_id: &ConversationId, total_tokens: u32) -> ContextEnvelope {
        ContextEnvelope {
            conversation_id: conversation_id.clone(),
            message_id: "m1".into(),
            system_prompt: "sys".into(),
            messages: vec![],
            total_tokens,
            truncated: false,
            metadata: ContextMetadata::default(),
            requested_at: Utc::now(),
        }
    }

    async fn fixture(model: Option<&str>) -> (Arc<InMemoryStore>, Arc<InProcessBus>, FlowOrchestrator, Conversation) {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InProcessBus::default());
        let mut conversation = Conversation::new("sp-1");
        conversation.model = model.map(String::from);
        store.save_conversation(&conversation).await.unwrap();
        let orchestrator = FlowOrchestrator::new(store.clone(), bus.clone(), OrchestratorSettings::default());
        (store, bus, orchestrator, conversation)
    }

    #[tokio::test]
    async fn default_model_applies() {
        let (_, _, orchestrator, conversation) = fixture(None).await;
        let env = orchestrator.plan(context(&conversation.id, 3900)).await.unwrap();
        assert_eq!(env.model, "gpt-4o-mini");
        assert_eq!(env.max_tokens, 512);
        assert!(env.tools_enabled);
        assert_eq!(env.context.total_tokens, 3900);
    }

    #[tokio::test]
    async fn preferred_model_wins() {
        let (_, _, orchestrator, conversation) = fixture(Some("claude-sonnet")).await;
        let env = orchestrator.plan(context(&conversation.id, 100)).await.unwrap();
        assert_eq!(env.model, "claude-sonnet");
        assert_eq!(env.max_tokens, 2048);
    }

    #[tokio::test]
    async fn missing_conversation_is_not_found() {
        let (_, _, orchestrator, _) = fixture(None).await;
        let err = orchestrator
            .plan(context(&ConversationId::from("ghost"), 10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    fn response(conversation_id: &ConversationId) -> InferenceResponse {
        InferenceResponse {
            conversation_id: conversation_id.clone(),
            message_id: "m1".into(),
            message: Message::assistant(conversation_id, "Hi there"),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 3,
                total_tokens: 13,
            },
            requested_at: Utc::now() - chrono::Duration::milliseconds(250),
        }
    }

    #[tokio::test]
    async fn response_is_appended_and_announced() {
        let (store, bus, orchestrator, conversation) = fixture(None).await;
        let subject = topics::conversation_message_new(&conversation.id);
        let notifications = bus.subscribe(&subject).await.unwrap();
        let response = response(&conversation.id);
        let payload = serde_json::to_vec(&response).unwrap();

        orchestrator.handle(topics::INFERENCE_RESPONSE, &payload).await.unwrap();
        // Redelivery appends nothing new
        orchestrator.handle(topics::INFERENCE_RESPONSE, &payload).await.unwrap();

        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.message_ids, vec![response.message.id.clone()]);

        let delivery = notifications.next().await.unwrap();
        let note: CompletionNotification = delivery.decode().unwrap();
        delivery.ack();
        assert_eq!(note.message.content, "Hi there");
        assert_eq!(note.usage.total_tokens, 13);
        assert!(note.duration_ms >= 250);

        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, topics::INFERENCE_RESPONSE);
        assert_eq!(events[0].message_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn missing_conversation_still_notifies() {
        let (_, bus, orchestrator, _) = fixture(None).await;
        let ghost = ConversationId::from("ghost");
        let notifications = bus.subscribe(&topics::conversation_message_new(&ghost)).await.unwrap();
        let payload = serde_json::to_vec(&response(&ghost)).unwrap();

        orchestrator.handle(topics::INFERENCE_RESPONSE, &payload).await.unwrap();
        let delivery = notifications.next().await.unwrap();
        delivery.ack();
    }

    #[tokio::test]
    async fn context_ready_emits_inference_request() {
        let (_, bus, orchestrator, conversation) = fixture(None).await;
        let requests = bus.subscribe(topics::INFERENCE_REQUEST).await.unwrap();
        let payload = serde_json::to_vec(&context(&conversation.id, 200)).unwrap();

        orchestrator.handle(topics::CONTEXT_READY, &payload).await.unwrap();

        let delivery = requests.next().await.unwrap();
        let env: InferenceEnvelope = delivery.decode().unwrap();
        delivery.ack();
        assert_eq!(env.context.conversation_id, conversation.id);
        assert_eq!(env.max_tokens, 2048);
    }
}
