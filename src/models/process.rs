use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of one run of one external job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessStatus {
    Initializing,
    Processing,
    Completed,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessStatus::Completed | ProcessStatus::Failed)
    }
}

/// One run of one acquired registry job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    pub client_id: Uuid,
    pub client_slug: String,
    pub project_id: Uuid,
    pub project_slug: String,
    pub project_name: String,
    pub status: ProcessStatus,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub manual_review_tasks: i64,
    /// Profile set frozen at acquisition, for audit.
    pub config_snapshot: serde_json::Value,
    /// Set once the `processing` status update has been delivered.
    pub processing_notified: bool,
    /// Set once the `completed` status update has been delivered.
    pub completed_notified: bool,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Process {
    /// All tasks accounted for: the process may close.
    pub fn all_tasks_terminal(&self) -> bool {
        self.completed_tasks + self.failed_tasks + self.manual_review_tasks == self.total_tasks
    }
}

/// Atomic counter deltas applied by the orchestrator as tasks reach
/// terminal states.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterDeltas {
    pub completed: i64,
    pub failed: i64,
    pub manual_review: i64,
}

impl CounterDeltas {
    pub fn completed() -> Self {
        Self {
            completed: 1,
            ..Self::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            failed: 1,
            ..Self::default()
        }
    }

    pub fn manual_review() -> Self {
        Self {
            manual_review: 1,
            ..Self::default()
        }
    }
}
