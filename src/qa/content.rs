//! Tier 2: content quality. A local scan catches prohibited phrases and
//! meta-descriptive language before any model time is spent; outputs that
//! survive the scan go to the QA model for a tone and phrasing review.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tokio::sync::Semaphore;

use crate::models::qa::{FailureCategory, TierVerdict};
use crate::profiles::schema::CorrectiveStage;
use crate::qa::verdict::parse_agent_verdict;
use crate::qa::QaError;
use crate::services::vision::{ModelCall, VisionModel};

/// Patterns that describe the act of looking at an image instead of its
/// content. First-person and image-referential phrasing fails here even
/// when the profile's prohibited list is empty.
fn meta_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bthis (image|photo|picture|photograph)\b",
            r"(?i)\bthe (image|photo|picture|photograph) (shows|depicts|contains|features)\b",
            r"(?i)\bin (this|the) (image|photo|picture)\b",
            r"(?i)\bi (can )?(see|observe|notice)\b",
            r"(?i)\bas an ai\b",
            r"(?i)\bit appears (that|to be)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("meta pattern compiles"))
        .collect()
    })
}

/// Local scan over the raw output. Returns the failure categories and
/// human-readable notes; empty means nothing objectionable was found.
pub fn scan(output: &str, prohibited: &[String]) -> (Vec<FailureCategory>, Vec<String>) {
    let mut categories = Vec::new();
    let mut notes = Vec::new();
    let lowered = output.to_lowercase();

    for phrase in prohibited {
        if !phrase.is_empty() && lowered.contains(&phrase.to_lowercase()) {
            if !categories.contains(&FailureCategory::ProhibitedPhrase) {
                categories.push(FailureCategory::ProhibitedPhrase);
            }
            notes.push(format!("contains prohibited phrase '{phrase}'"));
        }
    }
    for pattern in meta_patterns() {
        if let Some(found) = pattern.find(output) {
            if !categories.contains(&FailureCategory::MetaDescriptive) {
                categories.push(FailureCategory::MetaDescriptive);
            }
            notes.push(format!("meta-descriptive language: '{}'", found.as_str()));
        }
    }
    (categories, notes)
}

/// Full tier-2 review: local scan first, then the QA-model agent for
/// phrasing and tone judgment.
pub async fn review(
    model: &dyn VisionModel,
    semaphore: &Arc<Semaphore>,
    stage: &CorrectiveStage,
    prohibited: &[String],
    output: &str,
    image_b64: &str,
) -> Result<TierVerdict, QaError> {
    let (categories, notes) = scan(output, prohibited);
    if !categories.is_empty() {
        return Ok(TierVerdict::fail(categories, notes));
    }

    let review_prompt = stage
        .review_prompt
        .as_ref()
        .ok_or(QaError::MissingReviewPrompt(stage.tier))?;
    let rendered = crate::qa::render_review(review_prompt, output, image_b64)?;

    let mut call = ModelCall::from_params(&stage.model, stage.deadline_seconds);
    call.system = rendered.system;
    call.user = rendered.user;
    call.image_b64 = review_prompt
        .declares(crate::profiles::template::PLACEHOLDER_IMAGE)
        .then(|| image_b64.to_string());

    let response = {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| QaError::Shutdown)?;
        model.generate(&call).await?
    };
    Ok(parse_agent_verdict(&response, None))
}
