//! Corrective agent: asks the QA model to rewrite a failing output. The
//! rewrite prompt is tier-scoped so each correction targets the defect
//! class that was identified, and always carries the original image plus
//! the output under correction.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::profiles::schema::CorrectiveStage;
use crate::profiles::template::{PLACEHOLDER_IMAGE, PLACEHOLDER_PRIOR_OUTPUT};
use crate::qa::QaError;
use crate::services::vision::{ModelCall, VisionModel};

/// The outcome of one corrective rewrite.
pub struct Rewrite {
    /// The replacement output, which re-enters the same tier.
    pub content: String,
    /// The rendered prompt, recorded on the following QA attempt.
    pub prompt_used: String,
}

pub async fn rewrite(
    model: &dyn VisionModel,
    semaphore: &Arc<Semaphore>,
    stage: &CorrectiveStage,
    prior_output: &str,
    image_b64: &str,
) -> Result<Rewrite, QaError> {
    let mut values: BTreeMap<&str, String> = BTreeMap::new();
    values.insert(PLACEHOLDER_IMAGE, image_b64.to_string());
    values.insert(PLACEHOLDER_PRIOR_OUTPUT, prior_output.to_string());
    let rendered = stage.rewrite_prompt.render(&values)?;

    let mut call = ModelCall::from_params(&stage.model, stage.deadline_seconds);
    call.system = rendered.system;
    call.user = rendered.user.clone();
    call.image_b64 = Some(image_b64.to_string());

    let content = {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| QaError::Shutdown)?;
        model.generate(&call).await?
    };
    Ok(Rewrite {
        content,
        prompt_used: rendered.user,
    })
}
