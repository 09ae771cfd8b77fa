//! Conversation, Message and SystemPrompt domain types.
//!
//! These are the persisted entities that flow through the pipeline:
//! a user message is appended to a conversation, the context builder reads
//! a window of it, and the inference executor writes the assistant reply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::ToolCall;

/// Unique identifier for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive a stable id from a seed string.
///
/// Redelivered events must write the same rows, so ids of entities created
/// by a handler are derived from the id of the event that caused them.
pub fn derive_id(seed: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A single message in a conversation.
///
/// Immutable once created, except for `token_count`, which the tokenizing
/// collaborator may backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Owning conversation
    pub conversation_id: ConversationId,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Reserved for branching; the pipeline never reads it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Token cost of `content`. Zero means "not counted yet".
    #[serde(default)]
    pub token_count: u32,

    /// Model that produced this message (assistant messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn with_role(conversation_id: &ConversationId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            role,
            content: content.into(),
            parent_id: None,
            token_count: 0,
            model: None,
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(conversation_id: &ConversationId, content: impl Into<String>) -> Self {
        Self::with_role(conversation_id, Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(conversation_id: &ConversationId, content: impl Into<String>) -> Self {
        Self::with_role(conversation_id, Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(conversation_id: &ConversationId, content: impl Into<String>) -> Self {
        Self::with_role(conversation_id, Role::System, content)
    }

    /// Set a known token count.
    pub fn with_tokens(mut self, token_count: u32) -> Self {
        self.token_count = token_count;
        self
    }
}

/// A reusable system prompt referenced by conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub id: String,
    pub name: String,
    pub content: String,
    /// Zero means "not counted yet".
    #[serde(default)]
    pub token_count: u32,
}

impl SystemPrompt {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            content: content.into(),
            token_count: 0,
        }
    }

    pub fn with_tokens(mut self, token_count: u32) -> Self {
        self.token_count = token_count;
        self
    }
}

/// A conversation: an append-only list of message ids plus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Optional title (auto-generated or user-set)
    #[serde(default)]
    pub title: String,

    /// The system prompt this conversation runs under
    pub system_prompt_id: String,

    /// Preferred model; the configured default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Message ids in chronological order
    #[serde(default)]
    pub message_ids: Vec<String>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the conversation last changed
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new empty conversation bound to a system prompt.
    pub fn new(system_prompt_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            title: String::new(),
            system_prompt_id: system_prompt_id.into(),
            model: None,
            message_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message id. Returns `false` if it was already present,
    /// which makes replayed appends a no-op.
    pub fn append_message(&mut self, message_id: &str) -> bool {
        if self.message_ids.iter().any(|id| id == message_id) {
            return false;
        }
        self.message_ids.push(message_id.to_string());
        self.updated_at = Utc::now();
        true
    }

    /// The ids eligible as history for a turn triggered by `message_id`:
    /// everything up to and including the trigger, or every id if the
    /// trigger is not part of this conversation.
    pub fn history_through(&self, message_id: &str) -> &[String] {
        match self.message_ids.iter().position(|id| id == message_id) {
            Some(idx) => &self.message_ids[..=idx],
            None => &self.message_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let conv = ConversationId::from("c1");
        let msg = Message::user(&conv, "Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, agent!");
        assert_eq!(msg.token_count, 0);
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn append_is_idempotent() {
        let mut conv = Conversation::new("sp-1");
        let created = conv.updated_at;

        assert!(conv.append_message("m1"));
        assert!(!conv.append_message("m1"));
        assert!(conv.append_message("m2"));
        assert_eq!(conv.message_ids, vec!["m1", "m2"]);
        assert!(conv.updated_at >= created);
    }

    #[test]
    fn history_through_stops_at_trigger() {
        let mut conv = Conversation::new("sp-1");
        for id in ["a", "b", "c", "d"] {
            conv.append_message(id);
        }
        assert_eq!(conv.history_through("b"), ["a", "b"]);
        assert_eq!(conv.history_through("zzz").len(), 4);
    }

    #[test]
    fn conversation_id_is_a_bare_string_on_the_wire() {
        let id = ConversationId::from("conv-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"conv-42\"");
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(derive_id("assistant:m1"), derive_id("assistant:m1"));
        assert_ne!(derive_id("assistant:m1"), derive_id("assistant:m2"));
    }

    #[test]
    fn role_parse_matches_display() {
        for role in [Role::User, Role::Assistant, Role::System, Role::Tool] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("robot"), None);
    }
}
