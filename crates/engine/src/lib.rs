//! The agent execution engine.
//!
//! Drives an LLM through multi-turn tool-using conversations: the turn
//! loop alternates LLM calls with tool invocations, streams progress
//! events, compresses the context window under token pressure, and
//! persists sessions and traces.
//!
//! Entry points: [`agent::Agent::run`] for one request, and
//! [`published::PublishedChat`] for preset-backed chat with session
//! continuity.

pub mod agent;
pub mod cancel;
pub mod compress;
pub mod event_stream;
pub mod events;
pub mod published;
pub mod result;
pub mod tasks;
pub mod toolset;
pub mod trace;

pub use agent::{Agent, EngineDeps, RunInput, RunOptions};
pub use cancel::{CancelMap, CancelToken};
pub use event_stream::EventStream;
pub use events::{EventPayload, StreamEvent};
pub use result::AgentResult;
