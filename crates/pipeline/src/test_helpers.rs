//! Shared test helpers for stage tests.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Mutex;
use std::time::Duration;
use turnflow_core::error::{ProviderError, ToolError};
use turnflow_core::event::{ContextEnvelope, ContextMetadata, InferenceEnvelope};
use turnflow_core::message::{ConversationId, Message};
use turnflow_core::provider::{
    FinishReason, Provider, ProviderRequest, ProviderResponse, RequestedToolCall, ToolDefinition,
    Usage,
};
use turnflow_core::tool::ToolCatalog;

/// A mock provider that returns a sequence of scripted responses and
/// records every request it sees.
///
/// Panics if more calls are made than responses provided.
pub struct SequentialMockProvider {
    responses: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Option<Duration>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn single_text(text: &str) -> Self {
        Self::new(vec![Ok(make_text_response(text))])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut requests = self.requests.lock().unwrap();
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            panic!(
                "SequentialMockProvider: no more responses (call #{})",
                requests.len()
            );
        }
        requests.push(request);
        responses.remove(0)
    }
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        content: text.to_string(),
        tool_calls: Vec::new(),
        finish_reason: FinishReason::Stop,
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
        model: "mock-model".into(),
    }
}

/// Create a response requesting the given `(name, arguments)` tool calls.
pub fn make_tool_call_response(calls: &[(&str, Value)]) -> ProviderResponse {
    ProviderResponse {
        content: String::new(),
        tool_calls: calls
            .iter()
            .enumerate()
            .map(|(i, (name, arguments))| RequestedToolCall {
                id: format!("call_{i}"),
                name: name.to_string(),
                arguments: arguments.clone(),
            })
            .collect(),
        finish_reason: FinishReason::ToolCalls,
        usage: Usage {
            prompt_tokens: 20,
            completion_tokens: 8,
            total_tokens: 28,
        },
        model: "mock-model".into(),
    }
}

/// A catalog with one `lookup` tool taking a required string `query`.
pub struct StaticCatalog;

pub fn lookup_definition() -> ToolDefinition {
    ToolDefinition {
        name: "lookup".into(),
        description: "Look something up".into(),
        parameters: json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        }),
    }
}

#[async_trait]
impl ToolCatalog for StaticCatalog {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        Ok(vec![lookup_definition()])
    }
}

/// A catalog that is always down.
pub struct FailingCatalog;

#[async_trait]
impl ToolCatalog for FailingCatalog {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        Err(ToolError::CatalogUnavailable("catalog service down".into()))
    }
}

/// An inference envelope for one user message.
pub fn envelope(conversation_id: &ConversationId, trigger: &Message, tools_enabled: bool) -> InferenceEnvelope {
    InferenceEnvelope {
        context: ContextEnvelope {
            conversation_id: conversation_id.clone(),
            message_id: trigger.id.clone(),
            system_prompt: "You are helpful.".into(),
            messages: vec![trigger.clone()],
            total_tokens: 10,
            truncated: false,
            metadata: ContextMetadata::default(),
            requested_at: chrono::Utc::now(),
        },
        model: "gpt-test".into(),
        max_tokens: 512,
        temperature: 0.3,
        tools_enabled,
    }
}
