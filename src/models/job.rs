use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work handed out by the external job registry: one project,
/// many media, many requested analyses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryJob {
    pub client: ClientRef,
    pub project: ProjectRef,
    pub media: Vec<MediaRef>,
    pub analyses: Vec<AnalysisRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRef {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: Uuid,
    pub filename: String,
    pub optimised_path: String,
    pub greyscale_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRef {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
}

/// Reasons a job is rejected at acquisition before any state is created.
#[derive(Debug, thiserror::Error)]
pub enum JobValidationError {
    #[error("job has no media")]
    NoMedia,

    #[error("job has no analyses")]
    NoAnalyses,

    #[error("unknown analysis slug: {0}")]
    UnknownAnalysis(String),

    #[error("media {0} has an empty optimised path")]
    EmptyMediaPath(Uuid),
}

impl RegistryJob {
    /// Shape validation applied before a process is created. A job with no
    /// media or no analyses is rejected outright.
    pub fn validate(&self) -> Result<(), JobValidationError> {
        if self.media.is_empty() {
            return Err(JobValidationError::NoMedia);
        }
        if self.analyses.is_empty() {
            return Err(JobValidationError::NoAnalyses);
        }
        for m in &self.media {
            if m.optimised_path.trim().is_empty() {
                return Err(JobValidationError::EmptyMediaPath(m.id));
            }
        }
        for a in &self.analyses {
            if a.slug.parse::<crate::models::task::AnalysisType>().is_err() {
                return Err(JobValidationError::UnknownAnalysis(a.slug.clone()));
            }
        }
        Ok(())
    }
}

/// Body for `PUT /projects/{id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatusUpdate {
    pub status: ProjectStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Processing,
    Completed,
}

/// Body for `POST /projects/{p}/media/{m}/analysis/{a}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSubmission {
    pub model_used: String,
    pub user_prompt_used: String,
    pub system_prompt_used: String,
    pub status: String,
    pub analysis_result: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(media: usize, analyses: usize) -> RegistryJob {
        RegistryJob {
            client: ClientRef {
                id: Uuid::new_v4(),
                slug: "acme".into(),
                name: "Acme".into(),
            },
            project: ProjectRef {
                id: Uuid::new_v4(),
                slug: "spring".into(),
                name: "Spring Catalog".into(),
            },
            media: (0..media)
                .map(|i| MediaRef {
                    id: Uuid::new_v4(),
                    filename: format!("img-{i}.jpg"),
                    optimised_path: format!("https://img.example/{i}/opt.jpg"),
                    greyscale_path: None,
                })
                .collect(),
            analyses: (0..analyses)
                .map(|_| AnalysisRef {
                    id: Uuid::new_v4(),
                    name: "Colors".into(),
                    slug: "colors".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn empty_media_or_analyses_is_rejected() {
        assert!(matches!(
            job(0, 2).validate(),
            Err(JobValidationError::NoMedia)
        ));
        assert!(matches!(
            job(2, 0).validate(),
            Err(JobValidationError::NoAnalyses)
        ));
        assert!(job(2, 2).validate().is_ok());
    }

    #[test]
    fn unknown_analysis_slug_is_rejected() {
        let mut j = job(1, 1);
        j.analyses[0].slug = "sentiment".into();
        assert!(matches!(
            j.validate(),
            Err(JobValidationError::UnknownAnalysis(_))
        ));
    }
}
