//! Cancellation tokens.
//!
//! Each run gets a [`CancelToken`]; signalling it makes the turn loop
//! stop at its next checkpoint (turn start, after the LLM call, before
//! each tool, before appending tool results). [`CancelMap`] tracks the
//! active token per session so a stop request can find it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cancellation flag checked cooperatively by the turn loop.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Active cancellation tokens keyed by session id.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a token for a session's in-flight run.
    pub fn register(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .insert(session_id.to_owned(), token.clone());
        token
    }

    /// Cancel the run for a session. Returns true if one was registered.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.tokens.lock().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a session's token once its run completes.
    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn map_register_cancel_remove() {
        let map = CancelMap::new();
        let token = map.register("s1");
        assert!(map.is_running("s1"));

        assert!(map.cancel("s1"));
        assert!(token.is_cancelled());

        map.remove("s1");
        assert!(!map.is_running("s1"));
        assert!(!map.cancel("s1"));
    }

    #[test]
    fn register_replaces_previous_token() {
        let map = CancelMap::new();
        let old = map.register("s1");
        let new = map.register("s1");
        map.cancel("s1");
        assert!(!old.is_cancelled());
        assert!(new.is_cancelled());
    }
}
