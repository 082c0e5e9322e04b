//! Session dual-store.
//!
//! Every chat session persists two message lists: the append-only
//! display history the user sees, and the replaceable working context
//! the engine actually feeds the LLM (which may contain compression
//! summaries). See [`store::SessionStore`].

pub mod store;

pub use store::{SessionRecord, SessionStore};
