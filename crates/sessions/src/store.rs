//! JSON-file-backed session store.
//!
//! Keyed by session id. Two fields per record, two very different
//! contracts:
//! - `messages` — the user-visible display history. Append-only, never
//!   compressed, never rewritten.
//! - `agent_context` — the engine's working memory. Whole-replaced at
//!   the end of each request; may contain compression summaries. When
//!   unset, the engine works from `messages` directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sk_domain::error::{Error, Result};
use sk_domain::message::Message;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub agent_id: String,
    /// Append-only display history.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Replaceable working context; `None` means "use `messages`".
    #[serde(default)]
    pub agent_context: Option<Vec<Message>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// The message list the engine should feed the LLM.
    pub fn working_context(&self) -> &[Message] {
        match &self.agent_context {
            Some(ctx) => ctx,
            None => &self.messages,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session store backed by a JSON file. Per-session writes are
/// last-writer-wins; each session id is expected to have at most one
/// in-flight request, so no cross-request locking is attempted.
pub struct SessionStore {
    sessions_path: PathBuf,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    /// Load or create the store at `state_path/sessions.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let sessions_path = state_path.join("sessions.json");
        let sessions = if sessions_path.exists() {
            let raw = std::fs::read_to_string(&sessions_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            sessions_path,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Fetch a session, creating an empty record if missing.
    /// Returns `(record, is_new)`.
    pub fn load_or_create(&self, agent_id: &str, session_id: Option<&str>) -> (SessionRecord, bool) {
        if let Some(id) = session_id {
            if let Some(record) = self.sessions.read().get(id) {
                return (record.clone(), false);
            }
        }

        let now = Utc::now();
        let record = SessionRecord {
            session_id: session_id
                .map(str::to_owned)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            agent_id: agent_id.to_owned(),
            messages: Vec::new(),
            agent_context: None,
            created_at: now,
            updated_at: now,
        };
        self.sessions
            .write()
            .insert(record.session_id.clone(), record.clone());

        tracing::debug!(
            session_id = %record.session_id,
            agent_id = %agent_id,
            "session created"
        );
        (record, true)
    }

    /// Append messages to the display history. The display list only
    /// ever grows; compression never touches it.
    pub fn append_messages(&self, session_id: &str, new_messages: Vec<Message>) -> Result<()> {
        let mut sessions = self.sessions.write();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Session(format!("unknown session '{session_id}'")))?;
        record.messages.extend(new_messages);
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Replace the agent working context with the engine's final message
    /// list. Called after every request.
    pub fn checkpoint_context(&self, session_id: &str, context: Vec<Message>) -> Result<()> {
        let mut sessions = self.sessions.write();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Session(format!("unknown session '{session_id}'")))?;
        record.agent_context = Some(context);
        record.updated_at = Utc::now();
        Ok(())
    }

    pub fn list(&self, agent_id: Option<&str>) -> Vec<SessionRecord> {
        self.sessions
            .read()
            .values()
            .filter(|r| agent_id.map_or(true, |a| r.agent_id == a))
            .cloned()
            .collect()
    }

    /// Persist the current session state to disk.
    pub fn flush(&self) -> Result<()> {
        let sessions = self.sessions.read();
        let json = serde_json::to_string_pretty(&*sessions)
            .map_err(|e| Error::Session(format!("serializing sessions: {e}")))?;
        std::fs::write(&self.sessions_path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sk_domain::message::{ContentBlock, Message};

    fn store() -> (tempfile::TempDir, SessionStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn load_or_create_is_idempotent_per_id() {
        let (_tmp, store) = store();
        let (record, is_new) = store.load_or_create("agent-1", Some("s-1"));
        assert!(is_new);
        assert_eq!(record.session_id, "s-1");

        let (again, is_new) = store.load_or_create("agent-1", Some("s-1"));
        assert!(!is_new);
        assert_eq!(again.session_id, "s-1");
    }

    #[test]
    fn display_history_only_grows() {
        let (_tmp, store) = store();
        store.load_or_create("a", Some("s"));

        store
            .append_messages("s", vec![Message::user("q1"), Message::assistant("a1")])
            .unwrap();
        store
            .append_messages("s", vec![Message::user("q2"), Message::assistant("a2")])
            .unwrap();

        let record = store.get("s").unwrap();
        assert_eq!(record.messages.len(), 4);
        // Checkpointing the context must not shrink the display list.
        store
            .checkpoint_context("s", vec![Message::user("compressed summary")])
            .unwrap();
        assert_eq!(store.get("s").unwrap().messages.len(), 4);
    }

    #[test]
    fn working_context_prefers_agent_context() {
        let (_tmp, store) = store();
        store.load_or_create("a", Some("s"));
        store
            .append_messages("s", vec![Message::user("visible"), Message::assistant("reply")])
            .unwrap();

        // No checkpoint yet: working context mirrors display.
        let record = store.get("s").unwrap();
        assert_eq!(record.working_context().len(), 2);

        store
            .checkpoint_context(
                "s",
                vec![
                    Message::user("summary"),
                    Message::assistant_blocks(vec![ContentBlock::Text {
                        text: "ack".into(),
                    }]),
                ],
            )
            .unwrap();
        let record = store.get("s").unwrap();
        assert_eq!(record.working_context().len(), 2);
        assert!(matches!(
            &record.working_context()[0].content,
            sk_domain::message::MessageContent::Text(t) if t == "summary"
        ));
    }

    #[test]
    fn flush_and_reload_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::new(tmp.path()).unwrap();
            store.load_or_create("a", Some("persisted"));
            store
                .append_messages("persisted", vec![Message::user("hello")])
                .unwrap();
            store.flush().unwrap();
        }
        let store = SessionStore::new(tmp.path()).unwrap();
        let record = store.get("persisted").unwrap();
        assert_eq!(record.messages.len(), 1);
    }

    #[test]
    fn append_to_unknown_session_errors() {
        let (_tmp, store) = store();
        let err = store.append_messages("ghost", vec![Message::user("x")]);
        assert!(err.is_err());
    }
}
