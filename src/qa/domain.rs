//! Tier 3: domain-expert review. The QA model judges factual accuracy
//! against the original image with an expert prompt specific to the
//! analysis type; a confident pass is required, per-profile threshold.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::models::qa::TierVerdict;
use crate::profiles::schema::CorrectiveStage;
use crate::qa::verdict::parse_agent_verdict;
use crate::qa::QaError;
use crate::services::vision::{ModelCall, VisionModel};

pub async fn review(
    model: &dyn VisionModel,
    semaphore: &Arc<Semaphore>,
    stage: &CorrectiveStage,
    output: &str,
    image_b64: &str,
) -> Result<TierVerdict, QaError> {
    let review_prompt = stage
        .review_prompt
        .as_ref()
        .ok_or(QaError::MissingReviewPrompt(stage.tier))?;
    let rendered = crate::qa::render_review(review_prompt, output, image_b64)?;

    let mut call = ModelCall::from_params(&stage.model, stage.deadline_seconds);
    call.system = rendered.system;
    call.user = rendered.user;
    call.image_b64 = Some(image_b64.to_string());

    let response = {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| QaError::Shutdown)?;
        model.generate(&call).await?
    };
    Ok(parse_agent_verdict(&response, Some(stage.confidence_threshold)))
}
