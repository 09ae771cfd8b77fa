//! Tools for Turnflow.
//!
//! - [`schema`]: validates model-supplied arguments against a tool's schema
//! - [`CachedCatalog`]: TTL-cached tool listing for the inference executor
//! - [`ToolRunner`]: executes `tool.execute` requests against a registry
//! - built-in tools, collected by [`default_registry`]

pub mod catalog;
pub mod current_time;
pub mod runner;
pub mod schema;

use std::sync::Arc;
use turnflow_core::tool::ToolRegistry;

pub use catalog::CachedCatalog;
pub use runner::ToolRunner;
pub use schema::{validate_arguments, validate_call};

/// Create a registry with all built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(current_time::CurrentTimeTool));
    registry
}
