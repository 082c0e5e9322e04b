//! Trace recorder — a persistent audit record per engine run.
//!
//! The row is created *before* the turn loop starts so clients can poll
//! by trace id immediately, then updated once with the outcome and the
//! step / llm-call timelines. Records append to a JSONL log (latest
//! snapshot per id wins on reload), so traces survive restarts.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use sk_domain::error::{Error, Result};

use crate::result::{AgentResult, AgentStep, LlmCallRecord};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: String,
    pub request: String,
    pub skills_used: Vec<String>,
    pub model_provider: String,
    pub model: String,
    pub status: TraceStatus,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_turns: u32,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub steps: Vec<AgentStep>,
    pub llm_calls: Vec<LlmCallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TraceStore {
    records: RwLock<HashMap<String, TraceRecord>>,
    log_path: PathBuf,
    /// Serializes JSONL appends.
    write_lock: Mutex<()>,
}

impl TraceStore {
    /// Load or create the store at `state_path/traces.jsonl`.
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let log_path = state_path.join("traces.jsonl");

        let mut records = HashMap::new();
        if log_path.exists() {
            let raw = std::fs::read_to_string(&log_path).map_err(Error::Io)?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<TraceRecord>(line) {
                    // Later snapshots of the same id replace earlier ones.
                    Ok(record) => {
                        records.insert(record.id.clone(), record);
                    }
                    Err(e) => tracing::warn!(error = %e, "skipping malformed trace line"),
                }
            }
        }

        tracing::info!(
            traces = records.len(),
            path = %log_path.display(),
            "trace store loaded"
        );

        Ok(Self {
            records: RwLock::new(records),
            log_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Create the `running` row at request start. Returns the trace id.
    pub fn begin(
        &self,
        request: &str,
        model_provider: &str,
        model: &str,
        executor_name: Option<&str>,
        session_id: Option<&str>,
    ) -> String {
        let record = TraceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.to_string(),
            skills_used: Vec::new(),
            model_provider: model_provider.to_string(),
            model: model.to_string(),
            status: TraceStatus::Running,
            success: false,
            answer: None,
            error: None,
            total_turns: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            steps: Vec::new(),
            llm_calls: Vec::new(),
            duration_ms: None,
            executor_name: executor_name.map(str::to_owned),
            session_id: session_id.map(str::to_owned),
            created_at: Utc::now(),
        };
        let id = record.id.clone();
        self.persist(&record);
        self.records.write().insert(id.clone(), record);
        id
    }

    /// Update the pre-created row with the run's outcome.
    pub fn complete(&self, trace_id: &str, result: &AgentResult, duration_ms: u64) {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(trace_id) else {
            tracing::warn!(trace_id, "completing unknown trace");
            return;
        };
        record.status = if result.success {
            TraceStatus::Completed
        } else {
            TraceStatus::Failed
        };
        record.success = result.success;
        record.answer = Some(result.answer.clone());
        record.error = result.error.clone();
        record.total_turns = result.total_turns;
        record.total_input_tokens = result.total_input_tokens;
        record.total_output_tokens = result.total_output_tokens;
        record.steps = result.steps.clone();
        record.llm_calls = result.llm_calls.clone();
        record.skills_used = result.skills_used.clone();
        record.duration_ms = Some(duration_ms);

        let snapshot = record.clone();
        drop(records);
        self.persist(&snapshot);
    }

    pub fn get(&self, trace_id: &str) -> Option<TraceRecord> {
        self.records.read().get(trace_id).cloned()
    }

    pub fn list(&self) -> Vec<TraceRecord> {
        let mut all: Vec<TraceRecord> = self.records.read().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Append a snapshot to the JSONL log. Persistence failures are
    /// logged, never raised — the user-facing result still returns.
    fn persist(&self, record: &TraceRecord) {
        let _guard = self.write_lock.lock();
        let line = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize trace record");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist trace record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(success: bool) -> AgentResult {
        AgentResult {
            success,
            answer: "done".into(),
            steps: vec![AgentStep::assistant("hello")],
            llm_calls: vec![],
            total_turns: 2,
            total_input_tokens: 100,
            total_output_tokens: 40,
            error: if success { None } else { Some("cancelled".into()) },
            skills_used: vec!["data-analyzer".into()],
            output_files: vec![],
            final_messages: vec![],
        }
    }

    #[test]
    fn begin_creates_running_row_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path()).unwrap();

        let id = store.begin("do the thing", "anthropic", "claude-sonnet-4", None, Some("s-1"));
        let record = store.get(&id).unwrap();
        assert_eq!(record.status, TraceStatus::Running);
        assert_eq!(record.session_id.as_deref(), Some("s-1"));
        assert!(!record.success);
    }

    #[test]
    fn complete_updates_outcome_and_timeline() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path()).unwrap();

        let id = store.begin("task", "openai", "gpt-4o", None, None);
        store.complete(&id, &sample_result(true), 1234);

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, TraceStatus::Completed);
        assert_eq!(record.total_turns, 2);
        assert_eq!(record.duration_ms, Some(1234));
        assert_eq!(record.skills_used, vec!["data-analyzer"]);
        assert_eq!(record.steps.len(), 1);
    }

    #[test]
    fn traces_survive_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let id = {
            let store = TraceStore::new(tmp.path()).unwrap();
            let id = store.begin("persisted", "anthropic", "claude-sonnet-4", None, None);
            store.complete(&id, &sample_result(false), 10);
            id
        };

        let store = TraceStore::new(tmp.path()).unwrap();
        let record = store.get(&id).unwrap();
        // The completion snapshot (appended last) wins over the
        // running snapshot.
        assert_eq!(record.status, TraceStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn list_orders_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path()).unwrap();
        let first = store.begin("one", "anthropic", "m", None, None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.begin("two", "anthropic", "m", None, None);

        let listed = store.list();
        assert_eq!(listed[0].id, second);
        assert_eq!(listed[1].id, first);
    }
}
