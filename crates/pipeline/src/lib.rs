//! The Turnflow turn pipeline.
//!
//! Three stages, each a queue-group consumer on the event bus:
//!
//! 1. **Context Builder** (`context.request` → `context.ready`): loads the
//!    conversation and picks a token-bounded window of recent history
//! 2. **Flow Orchestrator** (`context.ready` → `inference.request`): chooses
//!    model, temperature and response headroom
//! 3. **Inference Executor** (`inference.request` → `inference.response`):
//!    calls the provider, persists the reply, dispatches tool calls
//!
//! The orchestrator closes the turn on `inference.response` by appending the
//! reply and publishing `conversation.<id>.message.new`. Tool calls go out on
//! `tool.execute`; their results come back on `tool.result` to the executor.
//!
//! [`worker`] holds the runtime every stage shares: N workers per stage,
//! per-stage deadlines, and the mapping of failures onto `system.error`.

pub mod context;
pub mod inference;
pub mod orchestrator;
pub mod runtime;
pub mod tool_runner;
pub mod worker;

#[cfg(test)]
mod test_helpers;

pub use context::{ContextBuilder, ContextSettings};
pub use inference::{InferenceExecutor, ToolResultOutcome, assistant_message_id};
pub use orchestrator::{FlowOrchestrator, OrchestratorSettings, response_ceiling};
pub use runtime::{Collaborators, Pipeline, submit_user_message};
pub use tool_runner::ToolRunnerStage;
pub use worker::{Service, ServiceConfig, Stage};
