//! Shared domain types for the skillrunner workspace.
//!
//! Everything that crosses a crate boundary lives here: the conversation
//! message model, provider-agnostic streaming events, tool call shapes,
//! the shared error type, and engine configuration defaults.

pub mod config;
pub mod error;
pub mod message;
pub mod stream;

pub use error::{Error, Result};
