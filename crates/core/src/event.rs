//! Pipeline events — the payloads that travel between stages.
//!
//! Stages never call each other. Each one consumes a topic and publishes the
//! next, so everything a downstream stage needs travels inside the payload
//! (including `requested_at`, which lets the orchestrator report the turn's
//! duration without keeping any state).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::message::{ConversationId, Message};
use crate::provider::{FinishReason, Usage};
use crate::tool::{ToolCall, ToolCallStatus};

/// Topic names.
pub mod topics {
    use crate::message::ConversationId;

    pub const CONTEXT_REQUEST: &str = "context.request";
    pub const CONTEXT_READY: &str = "context.ready";
    pub const INFERENCE_REQUEST: &str = "inference.request";
    pub const INFERENCE_RESPONSE: &str = "inference.response";
    pub const TOOL_EXECUTE: &str = "tool.execute";
    pub const TOOL_RESULT: &str = "tool.result";
    pub const SYSTEM_ERROR: &str = "system.error";

    /// Matches every conversation's completion subject.
    pub const ALL_CONVERSATION_MESSAGES: &str = "conversation.*.message.new";

    /// Per-conversation completion subject.
    pub fn conversation_message_new(id: &ConversationId) -> String {
        format!("conversation.{id}.message.new")
    }
}

/// A payload bound to a fixed topic.
pub trait Topic {
    const TOPIC: &'static str;
}

/// Ask the context builder to prepare a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub conversation_id: ConversationId,
    /// The triggering (user) message
    pub message_id: String,
    #[serde(default)]
    pub extended_knowledge: bool,
    /// Overrides the configured context ceiling for this turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ceiling: Option<u32>,
    #[serde(default = "Utc::now")]
    pub requested_at: DateTime<Utc>,
}

impl ContextRequest {
    pub fn new(conversation_id: &ConversationId, message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.clone(),
            message_id: message_id.into(),
            extended_knowledge: false,
            token_ceiling: None,
            requested_at: Utc::now(),
        }
    }
}

impl Topic for ContextRequest {
    const TOPIC: &'static str = topics::CONTEXT_REQUEST;
}

/// Diagnostics describing how a context window was chosen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    /// Messages in the conversation up to the trigger
    pub eligible_messages: usize,
    /// Messages fetched in the recent batch
    pub batch_messages: usize,
    pub selected_messages: usize,
    pub token_ceiling: u32,
    pub system_prompt_tokens: u32,
    /// Budget left for messages after the system prompt
    pub message_budget: u32,
    pub message_tokens: u32,
    /// Set when the newest message had to be cut
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_message_id: Option<String>,
    pub extended_knowledge_requested: bool,
    /// Selection strategy actually applied ("recency")
    pub retrieval: String,
}

/// A token-bounded slice of conversation history plus its system prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEnvelope {
    pub conversation_id: ConversationId,
    pub message_id: String,
    pub system_prompt: String,
    /// Chronological
    pub messages: Vec<Message>,
    /// System prompt plus selected messages
    pub total_tokens: u32,
    pub truncated: bool,
    pub metadata: ContextMetadata,
    pub requested_at: DateTime<Utc>,
}

impl Topic for ContextEnvelope {
    const TOPIC: &'static str = topics::CONTEXT_READY;
}

/// A context envelope with the inference parameters chosen for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceEnvelope {
    #[serde(flatten)]
    pub context: ContextEnvelope,
    pub model: String,
    /// Response token ceiling
    pub max_tokens: u32,
    pub temperature: f32,
    pub tools_enabled: bool,
}

impl Topic for InferenceEnvelope {
    const TOPIC: &'static str = topics::INFERENCE_REQUEST;
}

/// The outcome of one inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub conversation_id: ConversationId,
    /// The triggering message
    pub message_id: String,
    /// The persisted assistant message
    pub message: Message,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub requested_at: DateTime<Utc>,
}

impl Topic for InferenceResponse {
    const TOPIC: &'static str = topics::INFERENCE_RESPONSE;
}

/// Request for the tool runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecute {
    pub tool_call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    /// Owning assistant message
    pub message_id: String,
    pub conversation_id: ConversationId,
}

impl ToolExecute {
    pub fn for_call(call: &ToolCall, conversation_id: &ConversationId) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            message_id: call.message_id.clone(),
            conversation_id: conversation_id.clone(),
        }
    }
}

impl Topic for ToolExecute {
    const TOPIC: &'static str = topics::TOOL_EXECUTE;
}

/// What the tool runner reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEvent {
    pub tool_call_id: String,
    /// Owning assistant message
    pub message_id: String,
    pub conversation_id: ConversationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResultEvent {
    pub fn success(request: &ToolExecute, result: serde_json::Value) -> Self {
        Self {
            tool_call_id: request.tool_call_id.clone(),
            message_id: request.message_id.clone(),
            conversation_id: request.conversation_id.clone(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request: &ToolExecute, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: request.tool_call_id.clone(),
            message_id: request.message_id.clone(),
            conversation_id: request.conversation_id.clone(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// The terminal status this result asks for.
    pub fn status(&self) -> ToolCallStatus {
        if self.success {
            ToolCallStatus::Success {
                result: self.result.clone().unwrap_or(serde_json::Value::Null),
            }
        } else {
            ToolCallStatus::Error {
                message: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "tool reported failure without a message".into()),
            }
        }
    }
}

impl Topic for ToolResultEvent {
    const TOPIC: &'static str = topics::TOOL_RESULT;
}

/// A terminal failure of one turn, reported once by the stage that hit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemErrorEvent {
    pub error: String,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Originating stage (e.g. "context-builder")
    pub stage: String,
    pub occurred_at: DateTime<Utc>,
}

impl SystemErrorEvent {
    pub fn from_error(stage: &str, err: &Error) -> Self {
        Self {
            error: err.to_string(),
            kind: err.kind(),
            conversation_id: None,
            message_id: None,
            stage: stage.to_string(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_ids(mut self, conversation_id: Option<ConversationId>, message_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self.message_id = message_id;
        self
    }
}

impl Topic for SystemErrorEvent {
    const TOPIC: &'static str = topics::SYSTEM_ERROR;
}

/// Sent on `conversation.<id>.message.new` when a turn completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionNotification {
    pub conversation_id: ConversationId,
    pub message: Message,
    pub finish_reason: FinishReason,
    pub duration_ms: u64,
    pub usage: Usage,
}
