//! Error types for the Turnflow domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant, and every error can be
//! classified into an [`ErrorKind`] so pipeline stages know whether a failure
//! is reported, dropped, or surfaced to the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Turnflow operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Storage errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Bus errors ---
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Lookups ---
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    // --- Payload validation ---
    #[error("Validation failed: {0}")]
    Validation(String),

    // --- Deadlines ---
    #[error("Deadline of {after_ms}ms exceeded in {stage}")]
    DeadlineExceeded { stage: String, after_ms: u64 },

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure classes used by the worker runtime to pick a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A conversation, system prompt, or tool call is missing. Never retried.
    NotFound,
    /// Bus, store, or provider could not be reached or failed.
    #[serde(rename = "upstream_unavailable")]
    Upstream,
    /// Malformed payload. Logged and dropped.
    Validation,
    /// The stage deadline expired before the handler finished.
    DeadlineExceeded,
    /// Anything else.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Upstream => "upstream_unavailable",
            ErrorKind::Validation => "validation",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Shorthand for a [`Error::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Bus(BusError::Decode { .. }) => ErrorKind::Validation,
            Error::Provider(_) | Error::Store(_) | Error::Bus(_) => ErrorKind::Upstream,
            Error::Tool(ToolError::NotFound(_)) => ErrorKind::NotFound,
            Error::Tool(ToolError::InvalidArguments(_)) => ErrorKind::Validation,
            Error::Tool(_) => ErrorKind::Upstream,
            Error::Validation(_) | Error::Serialization(_) => ErrorKind::Validation,
            Error::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Error::Config { .. } | Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("Bus is closed")]
    Closed,

    #[error("Invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("Publish to {subject} failed: {reason}")]
    PublishFailed { subject: String, reason: String },

    #[error("Malformed payload on {subject}: {reason}")]
    Decode { subject: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool call {id} is already {status}; refusing transition to {attempted}")]
    InvalidTransition {
        id: String,
        status: String,
        attempted: String,
    },

    #[error("Tool catalog unavailable: {0}")]
    CatalogUnavailable(String),
}
