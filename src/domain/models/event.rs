//! Per-execution event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::Task;

/// Trimmed task configuration captured with each event, so that operators
/// can see what a past run executed even after the task changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub module: String,
    pub services: Vec<String>,
    pub condition: String,
    pub enabled: bool,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            module: task.module.source.clone(),
            services: task
                .watched_services()
                .into_iter()
                .map(|s| s.name)
                .collect(),
            condition: task.condition.kind().to_string(),
            enabled: task.enabled,
        }
    }
}

/// Immutable record of one driver execution for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub config: TaskSnapshot,
}

impl Event {
    /// Start recording an execution. Call [`EventRecorder::finish`] with the
    /// outcome to produce the event.
    pub fn start(task: &Task) -> EventRecorder {
        EventRecorder {
            id: Uuid::new_v4(),
            task_name: task.name.clone(),
            start_time: Utc::now(),
            config: TaskSnapshot::from(task),
        }
    }
}

/// In-progress event, holding everything known before the run completes.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    id: Uuid,
    task_name: String,
    start_time: DateTime<Utc>,
    config: TaskSnapshot,
}

impl EventRecorder {
    pub fn finish(self, result: Result<(), impl std::fmt::Display>) -> Event {
        let (success, error) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        Event {
            id: self.id,
            task_name: self.task_name,
            start_time: self.start_time,
            end_time: Utc::now(),
            success,
            error,
            config: self.config,
        }
    }
}
