//! # Turnflow Core
//!
//! Domain types, collaborator traits, events and error definitions for the
//! Turnflow turn pipeline. This crate has **no I/O of its own** — it defines
//! the contracts the pipeline stages and the concrete collaborators (stores,
//! providers, tool runners) implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`Store`] for persistence
//! - [`Provider`] for completions
//! - [`ToolCatalog`] / [`Tool`] for tools
//! - [`TokenCounter`] for token costs
//! - [`EventBus`] for stage-to-stage messaging
//!
//! The only concrete runtime piece is [`InProcessBus`], a queue-group bus for
//! running the whole pipeline inside one process.

pub mod bus;
pub mod cache;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod store;
pub mod token;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use bus::{Delivery, EventBus, EventBusExt, InProcessBus, Subscription};
pub use cache::TtlCache;
pub use error::{Error, ErrorKind, Result};
pub use event::{
    CompletionNotification, ContextEnvelope, ContextMetadata, ContextRequest, InferenceEnvelope,
    InferenceResponse, SystemErrorEvent, ToolExecute, ToolResultEvent, Topic,
};
pub use message::{Conversation, ConversationId, Message, Role, SystemPrompt};
pub use provider::{
    FinishReason, Provider, ProviderRequest, ProviderResponse, RequestedToolCall, ToolDefinition,
    Usage,
};
pub use store::{AppendOutcome, EventRecord, InsertOutcome, Store};
pub use token::{CharHeuristic, TokenCounter};
pub use tool::{Tool, ToolCall, ToolCallStatus, ToolCatalog, ToolRegistry};
