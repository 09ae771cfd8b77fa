//! Tool runner — executes `tool.execute` requests against a registry.
//!
//! The runner only turns a request into a result event; consuming
//! `tool.execute` and publishing `tool.result` is the worker runtime's job.

use std::time::Duration;
use tracing::{debug, warn};
use turnflow_core::error::ToolError;
use turnflow_core::event::{ToolExecute, ToolResultEvent};
use turnflow_core::tool::ToolRegistry;

pub struct ToolRunner {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute one request. Tool failures become a failed result, never an
    /// `Err`, so the caller always has something to publish.
    pub async fn run(&self, request: &ToolExecute) -> ToolResultEvent {
        debug!(
            tool = %request.name,
            tool_call_id = %request.tool_call_id,
            "Executing tool"
        );

        let outcome = tokio::time::timeout(
            self.timeout,
            self.registry.execute(&request.name, request.arguments.clone()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ToolError::Timeout {
                tool_name: request.name.clone(),
                timeout_secs: self.timeout.as_secs(),
            })
        });

        match outcome {
            Ok(data) => ToolResultEvent::success(request, data),
            Err(e) => {
                warn!(
                    tool = %request.name,
                    tool_call_id = %request.tool_call_id,
                    error = %e,
                    "Tool execution failed"
                );
                ToolResultEvent::failure(request, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use turnflow_core::message::ConversationId;
    use turnflow_core::tool::{Tool, ToolCall};

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Never finishes in time"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _arguments: Value) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn request(name: &str, arguments: Value) -> ToolExecute {
        let call = ToolCall::pending("m1", 0, name, arguments);
        ToolExecute::for_call(&call, &ConversationId::from("c1"))
    }

    fn runner() -> ToolRunner {
        let mut registry = crate::default_registry();
        registry.register(Arc::new(SlowTool));
        ToolRunner::new(registry, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn successful_tool_produces_success_result() {
        let req = request("current_time", json!({}));
        let result = runner().run(&req).await;
        assert!(result.success);
        assert_eq!(result.tool_call_id, req.tool_call_id);
        assert_eq!(result.message_id, "m1");
        assert_eq!(result.conversation_id, ConversationId::from("c1"));
        assert!(result.result.unwrap()["utc"].is_string());
    }

    #[tokio::test]
    async fn unknown_tool_produces_failure() {
        let result = runner().run(&request("nope", json!({}))).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_produces_failure() {
        let result = runner().run(&request("slow", json!({}))).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }
}
