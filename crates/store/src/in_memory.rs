//! In-memory store — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use turnflow_core::error::StoreError;
use turnflow_core::message::{Conversation, ConversationId, Message, SystemPrompt};
use turnflow_core::store::{AppendOutcome, EventRecord, InsertOutcome, Store};
use turnflow_core::tool::ToolCall;

/// A message as stored: the tool calls live in their own map so their
/// status can move independently of the message row.
struct StoredMessage {
    message: Message,
    call_ids: Vec<String>,
}

#[derive(Default)]
struct State {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<String, StoredMessage>,
    tool_calls: HashMap<String, ToolCall>,
    prompts: HashMap<String, SystemPrompt>,
    events: Vec<EventRecord>,
}

impl State {
    /// Upsert a message; tool calls that already exist keep their status.
    fn put_message(&mut self, message: &Message) {
        let mut call_ids = Vec::with_capacity(message.tool_calls.len());
        for call in &message.tool_calls {
            call_ids.push(call.id.clone());
            self.tool_calls
                .entry(call.id.clone())
                .or_insert_with(|| call.clone());
        }

        let mut row = message.clone();
        row.tool_calls.clear();
        self.messages.insert(
            message.id.clone(),
            StoredMessage {
                message: row,
                call_ids,
            },
        );
    }

    fn assemble(&self, stored: &StoredMessage) -> Message {
        let mut message = stored.message.clone();
        message.tool_calls = stored
            .call_ids
            .iter()
            .filter_map(|id| self.tool_calls.get(id).cloned())
            .collect();
        message
    }
}

/// A store that keeps everything in process memory behind one lock.
/// Every operation takes the lock once, so each is atomic.
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.state.read().await.conversations.get(id).cloned())
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.conversations.get_mut(&conversation.id) {
            Some(existing) => {
                // The id list only grows; keep ids appended concurrently.
                let mut merged = conversation.clone();
                for id in &existing.message_ids {
                    if !merged.message_ids.contains(id) {
                        merged.message_ids.push(id.clone());
                    }
                }
                *existing = merged;
            }
            None => {
                state
                    .conversations
                    .insert(conversation.id.clone(), conversation.clone());
            }
        }
        Ok(())
    }

    async fn append_message_id(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
    ) -> Result<AppendOutcome, StoreError> {
        let mut state = self.state.write().await;
        let Some(conversation) = state.conversations.get_mut(conversation_id) else {
            return Ok(AppendOutcome::MissingConversation);
        };
        if conversation.append_message(message_id) {
            Ok(AppendOutcome::Appended)
        } else {
            Ok(AppendOutcome::AlreadyPresent)
        }
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let state = self.state.read().await;
        Ok(state.messages.get(id).map(|m| state.assemble(m)))
    }

    async fn get_messages(&self, ids: &[String]) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.messages.get(id))
            .map(|m| state.assemble(m))
            .collect())
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        self.state.write().await.put_message(message);
        Ok(())
    }

    async fn insert_message_if_absent(&self, message: &Message) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.write().await;
        if let Some(stored) = state.messages.get(&message.id) {
            return Ok(InsertOutcome::Existing(state.assemble(stored)));
        }
        state.put_message(message);
        Ok(InsertOutcome::Inserted)
    }

    async fn get_system_prompt(&self, id: &str) -> Result<Option<SystemPrompt>, StoreError> {
        Ok(self.state.read().await.prompts.get(id).cloned())
    }

    async fn save_system_prompt(&self, prompt: &SystemPrompt) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .prompts
            .insert(prompt.id.clone(), prompt.clone());
        Ok(())
    }

    async fn get_tool_call(&self, id: &str) -> Result<Option<ToolCall>, StoreError> {
        Ok(self.state.read().await.tool_calls.get(id).cloned())
    }

    async fn complete_tool_call(&self, call: &ToolCall) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.tool_calls.get_mut(&call.id) {
            Some(stored) if stored.is_pending() && call.status.is_terminal() => {
                stored.status = call.status.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_event(&self, record: EventRecord) -> Result<(), StoreError> {
        self.state.write().await.events.push(record);
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.events.iter().rev().take(limit).cloned().collect())
    }
}
