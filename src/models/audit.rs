use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Severity attached to audit events; `High` is reserved for operator
/// attention (circuit breaker, unrecoverable store failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    High,
}

/// The kinds of state transitions recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditKind {
    ProcessCreated,
    ProcessStatusChanged,
    ProcessCompleted,
    ProcessCancelRequested,
    TasksExpanded,
    TaskLeased,
    TaskTransitioned,
    TaskReclaimed,
    ModelCallRetried,
    ModelCallFailed,
    OutputParseFailed,
    QaAttemptRecorded,
    CorrectiveApplied,
    ResultSubmitted,
    SubmissionAbandoned,
    SubmissionDuplicate,
    ReportSubmitted,
    CircuitBreakerTripped,
}

/// Append-only record of a state transition. Ordering per process is total
/// over `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub process_id: Uuid,
    pub seq: i64,
    pub task_id: Option<Uuid>,
    pub kind: AuditKind,
    pub severity: AuditSeverity,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// What the caller hands to `emit_audit`; sequence and timestamp are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub process_id: Uuid,
    pub task_id: Option<Uuid>,
    pub kind: AuditKind,
    pub severity: AuditSeverity,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
}

impl NewAuditEvent {
    pub fn new(process_id: Uuid, kind: AuditKind, payload: serde_json::Value) -> Self {
        Self {
            process_id,
            task_id: None,
            kind,
            severity: AuditSeverity::Info,
            payload,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }
}
