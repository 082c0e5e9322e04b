//! Background task records.
//!
//! Long-running engine invocations (skill creation, skill evolution)
//! are wrapped in a task whose status mirrors the run's trace outcome.
//! The queue itself lives elsewhere; the engine only owns the record
//! shape and status transitions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: String,
    pub task_type: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// In-memory task registry.
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, BackgroundTask>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, task_type: &str, metadata: Option<Value>) -> String {
        let task = BackgroundTask {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            status: TaskStatus::Pending,
            metadata_json: metadata,
            result_json: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let id = task.id.clone();
        self.tasks.write().insert(id.clone(), task);
        id
    }

    pub fn mark_running(&self, task_id: &str) {
        let mut tasks = self.tasks.write();
        if let Some(task) = tasks.get_mut(task_id) {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
        }
    }

    /// Terminal transition mirroring the run's trace outcome.
    pub fn finish(&self, task_id: &str, success: bool, result: Option<Value>, error: Option<String>) {
        let mut tasks = self.tasks.write();
        if let Some(task) = tasks.get_mut(task_id) {
            task.status = if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            task.result_json = result;
            task.error = error;
            task.completed_at = Some(Utc::now());
        }
    }

    pub fn get(&self, task_id: &str) -> Option<BackgroundTask> {
        self.tasks.read().get(task_id).cloned()
    }
}
