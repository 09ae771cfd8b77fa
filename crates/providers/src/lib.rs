//! Completion provider implementations for Turnflow.
//!
//! All providers implement the `turnflow_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
