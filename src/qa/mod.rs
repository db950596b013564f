//! Three-tier QA pipeline with per-tier corrective retry.
//!
//! Each tier validates the task's current output; a failure records the
//! attempt and, while attempts remain, hands the task to the tier's
//! corrective agent, whose rewrite re-enters the same tier. Exhausting a
//! tier's attempts sends the task to manual review and skips the rest.

pub mod content;
pub mod corrective;
pub mod domain;
pub mod structural;
pub mod verdict;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::db::store::{NewQaAttempt, StateStore, StoreError};
use crate::models::audit::{AuditKind, NewAuditEvent};
use crate::models::qa::QaTier;
use crate::models::task::{AnalysisType, Task};
use crate::profiles::template::{
    PromptTemplate, RenderedPrompt, TemplateError, PLACEHOLDER_IMAGE, PLACEHOLDER_PRIOR_OUTPUT,
};
use crate::profiles::ProfileSet;
use crate::services::vision::{ModelError, VisionModel};

/// Hard per-tier attempt cap. Not profile-configurable: a task may never
/// accumulate more than three attempts on any tier.
pub const MAX_QA_ATTEMPTS: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum QaError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("no profile for ({analysis_type}, {tier:?})")]
    MissingProfile {
        analysis_type: AnalysisType,
        tier: Option<QaTier>,
    },

    #[error("no review prompt configured for the {0} tier")]
    MissingReviewPrompt(QaTier),

    #[error("pipeline shutting down")]
    Shutdown,
}

/// Where a task stands after one pipeline pass.
#[derive(Debug)]
pub enum QaOutcome {
    /// All three tiers passed against the current output.
    Completed { confidence: f64 },
    /// A tier failed with attempts remaining; the caller parks the task
    /// on that tier's corrective queue.
    NeedsCorrective { tier: QaTier },
    /// A tier exhausted its attempts; remaining tiers are not run.
    ManualReview { tier: QaTier },
}

/// Render a review prompt. `{{PRIOR_OUTPUT}}` always carries the output
/// under review; `{{IMAGE}}` is filled when the template declares it.
pub(crate) fn render_review(
    prompt: &PromptTemplate,
    output: &str,
    image_b64: &str,
) -> Result<RenderedPrompt, TemplateError> {
    let mut values: BTreeMap<&str, String> = BTreeMap::new();
    values.insert(PLACEHOLDER_PRIOR_OUTPUT, output.to_string());
    if prompt.declares(PLACEHOLDER_IMAGE) {
        values.insert(PLACEHOLDER_IMAGE, image_b64.to_string());
    }
    prompt.render(&values)
}

pub struct QaPipeline {
    store: StateStore,
    model: Arc<dyn VisionModel>,
    semaphore: Arc<Semaphore>,
}

impl QaPipeline {
    pub fn new(store: StateStore, model: Arc<dyn VisionModel>, semaphore: Arc<Semaphore>) -> Self {
        Self {
            store,
            model,
            semaphore,
        }
    }

    /// Run tiers from the task's current position until completion, a
    /// corrective handoff, or exhaustion. `applied_corrective` is the
    /// rewrite prompt that produced the current output, if any; it is
    /// recorded on the first attempt of this pass.
    pub async fn run(
        &self,
        task: &Task,
        profiles: &ProfileSet,
        output: &str,
        image_b64: &str,
        mut applied_corrective: Option<String>,
    ) -> Result<QaOutcome, QaError> {
        let analysis_profile =
            profiles
                .analysis_profile(task.analysis_type)
                .ok_or(QaError::MissingProfile {
                    analysis_type: task.analysis_type,
                    tier: None,
                })?;
        let mut tier = task.current_tier.unwrap_or(QaTier::Structural);

        loop {
            let stage = profiles
                .corrective_stage(task.analysis_type, tier)
                .ok_or(QaError::MissingProfile {
                    analysis_type: task.analysis_type,
                    tier: Some(tier),
                })?;

            let started = Instant::now();
            let verdict = match tier {
                QaTier::Structural => {
                    structural::validate_structure(output, &analysis_profile.output_schema)
                }
                QaTier::ContentQuality => {
                    content::review(
                        self.model.as_ref(),
                        &self.semaphore,
                        &stage,
                        &analysis_profile.prohibited_phrases,
                        output,
                        image_b64,
                    )
                    .await?
                }
                QaTier::DomainExpert => {
                    domain::review(
                        self.model.as_ref(),
                        &self.semaphore,
                        &stage,
                        output,
                        image_b64,
                    )
                    .await?
                }
            };
            let duration_ms = started.elapsed().as_millis() as i64;

            let attempt = self
                .store
                .record_qa_attempt(NewQaAttempt {
                    task_id: task.id,
                    tier,
                    passed: verdict.passed,
                    failure_categories: verdict.categories.clone(),
                    corrective_prompt: applied_corrective.take(),
                    confidence: verdict.confidence,
                    duration_ms,
                })
                .await?;
            self.audit_attempt(task, tier, attempt.attempt_index, verdict.passed, &verdict.notes)
                .await?;

            tracing::debug!(
                task_id = %task.id,
                tier = %tier,
                attempt = attempt.attempt_index,
                passed = verdict.passed,
                "qa attempt recorded"
            );

            if verdict.passed {
                match tier.next() {
                    Some(next) => {
                        self.store.set_current_tier(task.id, Some(next)).await?;
                        tier = next;
                    }
                    None => {
                        return Ok(QaOutcome::Completed {
                            confidence: verdict.confidence,
                        })
                    }
                }
            } else if attempt.attempt_index >= MAX_QA_ATTEMPTS {
                return Ok(QaOutcome::ManualReview { tier });
            } else {
                return Ok(QaOutcome::NeedsCorrective { tier });
            }
        }
    }

    async fn audit_attempt(
        &self,
        task: &Task,
        tier: QaTier,
        index: i64,
        passed: bool,
        notes: &[String],
    ) -> Result<(), StoreError> {
        self.store
            .emit_audit(
                NewAuditEvent::new(
                    task.process_id,
                    AuditKind::QaAttemptRecorded,
                    serde_json::json!({
                        "tier": tier.to_string(),
                        "attempt": index,
                        "passed": passed,
                        "notes": notes,
                    }),
                )
                .for_task(task.id),
            )
            .await
    }

    /// Rewrite the task's current output with the tier's corrective agent
    /// and persist the replacement. Returns the rendered prompt for
    /// bookkeeping on the next attempt.
    pub async fn apply_corrective(
        &self,
        task: &Task,
        profiles: &ProfileSet,
        tier: QaTier,
        prior_output: &str,
        image_b64: &str,
    ) -> Result<corrective::Rewrite, QaError> {
        let stage = profiles
            .corrective_stage(task.analysis_type, tier)
            .ok_or(QaError::MissingProfile {
                analysis_type: task.analysis_type,
                tier: Some(tier),
            })?;
        let rewrite = corrective::rewrite(
            self.model.as_ref(),
            &self.semaphore,
            &stage,
            prior_output,
            image_b64,
        )
        .await?;
        self.store
            .emit_audit(
                NewAuditEvent::new(
                    task.process_id,
                    AuditKind::CorrectiveApplied,
                    serde_json::json!({
                        "tier": tier.to_string(),
                        "model": stage.model.name,
                    }),
                )
                .for_task(task.id),
            )
            .await?;
        Ok(rewrite)
    }
}
