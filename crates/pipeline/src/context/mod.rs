//! Context construction.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`window`] | Pure token-budget selection over a recent batch |
//! | [`builder`] | The `context-builder` stage: loads, selects, publishes |

pub mod builder;
pub mod window;

pub use builder::{ContextBuilder, ContextSettings};
pub use window::{Window, WindowBudget, count_missing, select_window};
