//! Tool calls and the tool abstractions the pipeline consumes.
//!
//! A [`ToolCall`] is created by the inference executor in the `pending`
//! state and resolved exactly once by a `tool.result` event:
//!
//! ```text
//! pending ──► success { result }
//!    │
//!    └──────► error { message }
//! ```
//!
//! Terminal states never change again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ToolError;
use crate::message::derive_id;
use crate::provider::ToolDefinition;

/// Lifecycle state of a tool call. Terminal variants carry their outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Success { result: serde_json::Value },
    Error { message: String },
}

impl ToolCallStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCallStatus::Pending => "pending",
            ToolCallStatus::Success { .. } => "success",
            ToolCallStatus::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ToolCallStatus::Pending)
    }
}

/// A tool invocation requested by the model, tracked to a terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID
    pub id: String,

    /// The assistant message that carries this call
    pub message_id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,

    pub created_at: DateTime<Utc>,

    pub status: ToolCallStatus,
}

impl ToolCall {
    /// Create a pending tool call. The id is derived from the owning message
    /// and the call's position so a replayed turn produces the same id.
    pub fn pending(
        message_id: &str,
        index: usize,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: derive_id(&format!("tool-call:{message_id}:{index}")),
            message_id: message_id.to_string(),
            name: name.into(),
            arguments,
            created_at: Utc::now(),
            status: ToolCallStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Move to `success`, attaching the result data.
    pub fn succeed(&mut self, result: serde_json::Value) -> Result<(), ToolError> {
        self.resolve(ToolCallStatus::Success { result })
    }

    /// Move to `error`, attaching a human-readable message.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), ToolError> {
        self.resolve(ToolCallStatus::Error {
            message: message.into(),
        })
    }

    /// Move a pending call to a terminal status. Fails if the call is
    /// already terminal or `next` is `Pending`.
    pub fn resolve(&mut self, next: ToolCallStatus) -> Result<(), ToolError> {
        if self.status.is_terminal() || !next.is_terminal() {
            return Err(ToolError::InvalidTransition {
                id: self.id.clone(),
                status: self.status.name().to_string(),
                attempted: next.name().to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// An executable capability.
///
/// Implementations live in `turnflow-tools`; the tool runner looks them up
/// by name when a `tool.execute` event arrives.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "current_time").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Source of the tools a model may call.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError>;
}

/// A registry of available tools, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(arguments).await
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolCatalog for ToolRegistry {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        Ok(self.definitions())
    }
}
