//! Store trait — the persistence contract the pipeline consumes.
//!
//! Every write is an idempotent upsert keyed by entity id, because the bus
//! delivers at least once and a handler may run twice for one event.
//!
//! Implementations: SQLite and in-memory (in `turnflow-store`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::{Conversation, ConversationId, Message, SystemPrompt};
use crate::tool::ToolCall;

/// Result of appending a message id to a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The id was already in the list; nothing changed.
    AlreadyPresent,
    MissingConversation,
}

/// Result of an insert-if-absent message write.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The message was written as given.
    Inserted,
    /// A message with that id already existed; it is returned unchanged.
    Existing(Message),
}

/// An entry in the audit event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    /// What happened, usually the topic name (e.g. "system.error")
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            conversation_id: None,
            message_id: None,
            payload,
            recorded_at: Utc::now(),
        }
    }

    pub fn for_turn(mut self, conversation_id: &ConversationId, message_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.clone());
        self.message_id = Some(message_id.to_string());
        self
    }
}

/// The core Store trait.
#[async_trait]
pub trait Store: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    // --- Conversations ---

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Insert or replace a conversation.
    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Atomically append a message id to a conversation's list.
    async fn append_message_id(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
    ) -> Result<AppendOutcome, StoreError>;

    // --- Messages ---

    async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError>;

    /// Fetch several messages, returned in the order of `ids`.
    /// Unknown ids are skipped.
    async fn get_messages(&self, ids: &[String]) -> Result<Vec<Message>, StoreError>;

    /// Upsert a message and its tool calls. Tool calls that already exist
    /// keep their stored status.
    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Write a message and its tool calls only if no message with that id
    /// exists yet. Concurrent callers agree on a single winner.
    async fn insert_message_if_absent(&self, message: &Message) -> Result<InsertOutcome, StoreError>;

    // --- System prompts ---

    async fn get_system_prompt(&self, id: &str) -> Result<Option<SystemPrompt>, StoreError>;

    async fn save_system_prompt(&self, prompt: &SystemPrompt) -> Result<(), StoreError>;

    // --- Tool calls ---

    async fn get_tool_call(&self, id: &str) -> Result<Option<ToolCall>, StoreError>;

    /// Persist a terminal status, but only if the stored call is still
    /// pending. Returns `false` when nothing was written.
    async fn complete_tool_call(&self, call: &ToolCall) -> Result<bool, StoreError>;

    // --- Audit ---

    async fn append_event(&self, record: EventRecord) -> Result<(), StoreError>;

    /// Most recent audit records, newest first.
    async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError>;
}
