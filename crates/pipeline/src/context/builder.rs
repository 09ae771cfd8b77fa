//! Context Builder — turns a `context.request` into a `context.ready`
//! envelope.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use turnflow_config::ContextConfig;
use turnflow_core::bus::{EventBus, EventBusExt};
use turnflow_core::error::{Error, Result};
use turnflow_core::event::{ContextEnvelope, ContextMetadata, ContextRequest, topics};
use turnflow_core::store::Store;
use turnflow_core::token::TokenCounter;

use super::window::{WindowBudget, count_missing, select_window};
use crate::worker::{Stage, decode};

/// Label recorded in metadata for how history was chosen.
const RECENCY: &str = "recency";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSettings {
    /// Default ceiling when a request carries no override.
    pub token_ceiling: u32,
    pub recent_batch_size: usize,
    pub truncation_reserve: u32,
}

impl From<&ContextConfig> for ContextSettings {
    fn from(c: &ContextConfig) -> Self {
        Self {
            token_ceiling: c.token_ceiling,
            recent_batch_size: c.recent_batch_size,
            truncation_reserve: c.truncation_reserve_tokens,
        }
    }
}

impl Default for ContextSettings {
    fn default() -> Self {
        (&ContextConfig::default()).into()
    }
}

pub struct ContextBuilder {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    counter: Arc<dyn TokenCounter>,
    settings: ContextSettings,
}

impl ContextBuilder {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        counter: Arc<dyn TokenCounter>,
        settings: ContextSettings,
    ) -> Self {
        Self {
            store,
            bus,
            counter,
            settings,
        }
    }

    /// Build the envelope for one request. Reads only; safe to repeat.
    pub async fn build(&self, request: &ContextRequest) -> Result<ContextEnvelope> {
        let conversation = self
            .store
            .get_conversation(&request.conversation_id)
            .await?
            .ok_or_else(|| Error::not_found("conversation", request.conversation_id.as_str()))?;

        let prompt = self
            .store
            .get_system_prompt(&conversation.system_prompt_id)
            .await?
            .ok_or_else(|| Error::not_found("system prompt", &conversation.system_prompt_id))?;

        let system_tokens = match prompt.token_count {
            0 => self.counter.count(&prompt.content),
            n => n,
        };

        let eligible = conversation.history_through(&request.message_id);
        let batch_start = eligible.len().saturating_sub(self.settings.recent_batch_size);
        let batch_ids = &eligible[batch_start..];

        let mut batch = self.store.get_messages(batch_ids).await?;
        count_missing(&mut batch, self.counter.as_ref());

        let budget = WindowBudget {
            ceiling: request.token_ceiling.unwrap_or(self.settings.token_ceiling),
            system_tokens,
            truncation_reserve: self.settings.truncation_reserve,
        };
        let fetched = batch.len();
        let window = select_window(batch, eligible.len(), budget, self.counter.as_ref());

        debug!(
            conversation_id = %request.conversation_id,
            message_id = %request.message_id,
            eligible = eligible.len(),
            selected = window.messages.len(),
            tokens = system_tokens + window.message_tokens,
            truncated = window.truncated,
            "Context window selected"
        );

        let metadata = ContextMetadata {
            eligible_messages: eligible.len(),
            batch_messages: fetched,
            selected_messages: window.messages.len(),
            token_ceiling: budget.ceiling,
            system_prompt_tokens: system_tokens,
            message_budget: budget.message_budget(),
            message_tokens: window.message_tokens,
            truncated_message_id: window.truncated_message_id,
            extended_knowledge_requested: request.extended_knowledge,
            // Extended knowledge falls back to recency selection
            retrieval: RECENCY.to_string(),
        };

        Ok(ContextEnvelope {
            conversation_id: request.conversation_id.clone(),
            message_id: request.message_id.clone(),
            system_prompt: prompt.content,
            messages: window.messages,
            total_tokens: system_tokens + window.message_tokens,
            truncated: window.truncated,
            metadata,
            requested_at: request.requested_at,
        })
    }
}

#[async_trait]
impl Stage for ContextBuilder {
    fn name(&self) -> &'static str {
        "context-builder"
    }

    fn subjects(&self) -> &'static [&'static str] {
        &[topics::CONTEXT_REQUEST]
    }

    async fn handle(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let request: ContextRequest = decode(subject, payload)?;
        let envelope = self.build(&request).await?;
        self.bus.emit(&envelope).await?;
        info!(
            conversation_id = %envelope.conversation_id,
            message_id = %envelope.message_id,
            messages = envelope.messages.len(),
            total_tokens = envelope.total_tokens,
            truncated = envelope.truncated,
            "Context ready"
        );
        Ok(())
    }
}
