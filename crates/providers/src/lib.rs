//! LLM provider adapters.
//!
//! One trait ([`LlmClient`]), four providers: Anthropic (native Messages
//! API), OpenAI and OpenRouter (both via the chat-completions adapter),
//! and Google Gemini. Adapters translate the shared message/tool schema
//! to each provider's wire format and normalize responses back.
//!
//! Adapters never retry — the turn loop owns retry policy and uses
//! [`retry::is_retryable`] to classify failures.

pub mod anthropic;
pub mod google;
pub mod models;
pub mod openai_compat;
pub mod registry;
pub mod retry;
pub mod sse;
pub mod traits;
pub mod util;

pub use registry::build_client;
pub use traits::{LlmClient, LlmRequest, LlmResponse};
