use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::models::qa::QaTier;

/// The closed set of analyses the vision model can run against an image.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnalysisType {
    Activities,
    Ages,
    BodyShapes,
    Captions,
    Category,
    Colors,
    Composition,
    Emotions,
    Ethnicity,
    Events,
    Gender,
    Lighting,
    Locations,
    Objects,
    Occlusions,
    Outfits,
    Relationships,
    SceneDescription,
    Themes,
    TimeOfDay,
    Weather,
}

/// Status of one image×analysis task.
///
/// `Completed`, `Failed` and `ManualReview` are absorbing: once a task
/// reaches one of them no further transition is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    AwaitingQa,
    Completed,
    Failed,
    ManualReview,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::ManualReview
        )
    }
}

/// Registry submission state, recorded so a second submission attempt for
/// the same task is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubmissionState {
    Unsubmitted,
    Submitted,
    Abandoned,
}

/// The raw model output currently attached to a task, with the provenance
/// the registry wants echoed back on submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOutput {
    pub content: String,
    pub model_used: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub produced_at: DateTime<Utc>,
}

/// One (media, analysis type) pair within a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub process_id: Uuid,
    pub media_id: Uuid,
    pub analysis_id: Uuid,
    pub analysis_type: AnalysisType,
    pub optimised_url: String,
    pub greyscale_url: Option<String>,
    pub status: TaskStatus,
    /// Lease reclaims; counts how many times the task was handed back to
    /// `pending` after a worker stall.
    pub attempt_count: i64,
    pub qa_attempts_structural: i64,
    pub qa_attempts_content: i64,
    pub qa_attempts_domain: i64,
    /// Tier the task is currently parked at while `awaiting_qa`.
    pub current_tier: Option<QaTier>,
    pub confidence: Option<f64>,
    pub last_error: Option<String>,
    pub output: Option<RawOutput>,
    /// Profile set version pinned when the task first entered QA.
    pub profile_version: Option<String>,
    pub submission_state: SubmissionState,
    pub worker_id: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn qa_attempts_for(&self, tier: QaTier) -> i64 {
        match tier {
            QaTier::Structural => self.qa_attempts_structural,
            QaTier::ContentQuality => self.qa_attempts_content,
            QaTier::DomainExpert => self.qa_attempts_domain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn analysis_type_set_is_closed_at_21() {
        assert_eq!(AnalysisType::iter().count(), 21);
    }

    #[test]
    fn analysis_type_round_trips_through_snake_case() {
        for t in AnalysisType::iter() {
            let s = t.to_string();
            assert_eq!(s.parse::<AnalysisType>().unwrap(), t);
        }
        assert_eq!(
            "scene_description".parse::<AnalysisType>().unwrap(),
            AnalysisType::SceneDescription
        );
    }

    #[test]
    fn terminal_statuses_are_flagged() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::ManualReview.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::AwaitingQa.is_terminal());
    }
}
