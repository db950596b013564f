use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// The three QA stages, always run in this order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QaTier {
    Structural,
    ContentQuality,
    DomainExpert,
}

impl QaTier {
    pub const ALL: [QaTier; 3] = [QaTier::Structural, QaTier::ContentQuality, QaTier::DomainExpert];

    /// The tier that follows this one, or `None` after `DomainExpert`.
    pub fn next(self) -> Option<QaTier> {
        match self {
            QaTier::Structural => Some(QaTier::ContentQuality),
            QaTier::ContentQuality => Some(QaTier::DomainExpert),
            QaTier::DomainExpert => None,
        }
    }
}

/// Failure categories a tier can attach to a failing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureCategory {
    MalformedOutput,
    MissingField,
    TypeMismatch,
    EnumViolation,
    LengthViolation,
    PatternViolation,
    ProhibitedPhrase,
    MetaDescriptive,
    ToneViolation,
    LowConfidence,
    AgentError,
}

/// Outcome of running one tier's validator once.
#[derive(Debug, Clone)]
pub struct TierVerdict {
    pub passed: bool,
    pub confidence: f64,
    pub categories: Vec<FailureCategory>,
    pub notes: Vec<String>,
}

impl TierVerdict {
    pub fn pass(confidence: f64) -> Self {
        Self {
            passed: true,
            confidence,
            categories: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn fail(categories: Vec<FailureCategory>, notes: Vec<String>) -> Self {
        Self {
            passed: false,
            confidence: 0.0,
            categories,
            notes,
        }
    }
}

/// One execution of one QA tier against one task. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaAttempt {
    pub id: Uuid,
    pub task_id: Uuid,
    pub tier: QaTier,
    /// 1-based index within the tier, capped at the profile's max attempts.
    pub attempt_index: i64,
    pub passed: bool,
    pub failure_categories: Vec<FailureCategory>,
    pub corrective_prompt: Option<String>,
    pub confidence: f64,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}
