//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM and any endpoint exposing
//! `/chat/completions` with function calling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use turnflow_config::ProviderConfig;
use turnflow_core::error::ProviderError;
use turnflow_core::message::{Message, Role};
use turnflow_core::provider::{
    FinishReason, Provider, ProviderRequest, ProviderResponse, RequestedToolCall, ToolDefinition,
    Usage,
};
use turnflow_core::tool::ToolCallStatus;

/// An OpenAI-compatible completion provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Build from the `[provider]` config section.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            ProviderError::NotConfigured(
                "no API key (set provider.api_key, TURNFLOW_API_KEY or OPENAI_API_KEY)".into(),
            )
        })?;
        Self::new(
            "openai_compat",
            &config.api_url,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert the system prompt and window into OpenAI chat messages.
    ///
    /// Earlier tool calls are folded into the assistant text: the pipeline
    /// does not keep tool-role replies, and the API rejects an assistant
    /// `tool_calls` entry without them.
    fn to_api_messages(system_prompt: &str, messages: &[Message]) -> Vec<ApiMessage> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            out.push(ApiMessage::text("system", system_prompt));
        }
        for m in messages {
            let message = match m.role {
                Role::User => ApiMessage::text("user", &m.content),
                Role::System => ApiMessage::text("system", &m.content),
                Role::Tool => ApiMessage::text("user", &format!("[tool output] {}", m.content)),
                Role::Assistant => {
                    let mut content = m.content.clone();
                    for call in &m.tool_calls {
                        let outcome = match &call.status {
                            ToolCallStatus::Pending => "pending".to_string(),
                            ToolCallStatus::Success { result } => result.to_string(),
                            ToolCallStatus::Error { message } => format!("error: {message}"),
                        };
                        if !content.is_empty() {
                            content.push('\n');
                        }
                        content.push_str(&format!(
                            "[called {}({}) -> {}]",
                            call.name, call.arguments, outcome
                        ));
                    }
                    ApiMessage::text("assistant", &content)
                }
            };
            out.push(message);
        }
        out
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn build_body(request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.system_prompt, &request.messages),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        body
    }

    fn parse_response(api: ApiResponse) -> Result<ProviderResponse, ProviderError> {
        let choice = api
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| RequestedToolCall {
                // Unparseable arguments stay a string so validation rejects them
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::String(tc.function.arguments)),
                id: tc.id,
                name: tc.function.name,
            })
            .collect();

        let usage = api
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(ProviderResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map(FinishReason::parse)
                .unwrap_or_default(),
            usage,
            model: api.model,
        })
    }
}

fn status_error(status: u16, body: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: 5,
        },
        401 | 403 => {
            ProviderError::AuthenticationFailed("Invalid API key or insufficient permissions".into())
        }
        404 => ProviderError::ModelNotFound(body),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(&request);

        debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending completion request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider returned error");
            return Err(status_error(status, error_body));
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        Self::parse_response(api_response)
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
}

impl ApiMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use turnflow_core::message::ConversationId;
    use turnflow_core::tool::ToolCall;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(
            "test",
            "http://localhost:11434/v1/",
            "sk-test",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn trailing_slash_trimmed() {
        assert_eq!(provider().base_url(), "http://localhost:11434/v1");
        assert_eq!(provider().name(), "test");
    }

    #[test]
    fn from_config_requires_key() {
        let config = ProviderConfig::default();
        assert!(matches!(
            OpenAiCompatProvider::from_config(&config),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn system_prompt_goes_first() {
        let conv = ConversationId::from("c1");
        let messages = vec![Message::user(&conv, "Hello"), Message::assistant(&conv, "Hi!")];
        let api = OpenAiCompatProvider::to_api_messages("Be brief.", &messages);
        assert_eq!(api.len(), 3);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[0].content.as_deref(), Some("Be brief."));
        assert_eq!(api[1].role, "user");
        assert_eq!(api[2].role, "assistant");
    }

    #[test]
    fn earlier_tool_calls_are_folded_into_text() {
        let conv = ConversationId::from("c1");
        let mut msg = Message::assistant(&conv, "");
        let mut call = ToolCall::pending(&msg.id, 0, "current_time", json!({}));
        call.succeed(json!({"utc": "2026-01-01T00:00:00Z"})).unwrap();
        msg.tool_calls.push(call);

        let api = OpenAiCompatProvider::to_api_messages("", &[msg]);
        assert_eq!(api.len(), 1);
        assert!(api[0].tool_calls.is_none());
        let text = api[0].content.as_deref().unwrap();
        assert!(text.contains("current_time"));
        assert!(text.contains("2026-01-01"));
    }

    #[test]
    fn body_includes_tools_and_limits() {
        let request = ProviderRequest {
            model: "gpt-4o-mini".into(),
            system_prompt: String::new(),
            messages: vec![],
            temperature: 0.2,
            max_tokens: 512,
            tools: vec![ToolDefinition {
                name: "current_time".into(),
                description: "now".into(),
                parameters: json!({"type": "object"}),
            }],
        };
        let body = OpenAiCompatProvider::build_body(&request);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "current_time");
    }

    #[test]
    fn body_omits_empty_tools() {
        let request = ProviderRequest {
            model: "m".into(),
            system_prompt: "s".into(),
            messages: vec![],
            temperature: 0.7,
            max_tokens: 100,
            tools: vec![],
        };
        assert!(OpenAiCompatProvider::build_body(&request).get("tools").is_none());
    }

    #[test]
    fn parse_text_response() {
        let api: ApiResponse = serde_json::from_value(json!({
            "model": "gpt-4o-mini-2024",
            "choices": [{
                "message": {"role": "assistant", "content": "Hello there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }))
        .unwrap();
        let resp = OpenAiCompatProvider::parse_response(api).unwrap();
        assert_eq!(resp.content, "Hello there");
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.usage.total_tokens, 15);
        assert_eq!(resp.model, "gpt-4o-mini-2024");
    }

    #[test]
    fn parse_tool_call_response() {
        let api: ApiResponse = serde_json::from_value(json!({
            "model": "m",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function",
                         "function": {"name": "current_time", "arguments": "{\"utc_offset_minutes\":60}"}},
                        {"id": "call_2", "type": "function",
                         "function": {"name": "broken", "arguments": "{not json"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();
        let resp = OpenAiCompatProvider::parse_response(api).unwrap();
        assert_eq!(resp.content, "");
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.usage, Usage::default());
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].arguments, json!({"utc_offset_minutes": 60}));
        assert_eq!(resp.tool_calls[1].arguments, json!("{not json"));
    }

    #[test]
    fn parse_empty_choices_is_error() {
        let api: ApiResponse =
            serde_json::from_value(json!({"model": "m", "choices": []})).unwrap();
        assert!(OpenAiCompatProvider::parse_response(api).is_err());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(429, String::new()),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            status_error(401, String::new()),
            ProviderError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            status_error(404, "no such model".into()),
            ProviderError::ModelNotFound(_)
        ));
        assert!(matches!(
            status_error(500, "oops".into()),
            ProviderError::ApiError { status_code: 500, .. }
        ));
    }
}
