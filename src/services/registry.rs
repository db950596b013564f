//! Client for the external job registry. Jobs are acquired with
//! `GET /next-job`; per-task results, project status, and the final
//! quality report are pushed back against the project.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use uuid::Uuid;

use crate::models::job::{AnalysisSubmission, ProjectStatus, ProjectStatusUpdate, RegistryJob};
use crate::models::report::QualityReport;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry rejected credentials (401)")]
    Unauthorized,

    #[error("registry rejected the request: {status} {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("registry server error: {0}")]
    Server(StatusCode),
}

impl RegistryError {
    /// 5xx and transport errors are worth another try; 4xx never is.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Server(_) => true,
            RegistryError::Http(e) => e.status().is_none_or(|s| s.is_server_error()),
            _ => false,
        }
    }
}

/// The registry operations the orchestrator needs; implemented over HTTP
/// in production and faked in tests.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Poll for the next available job. `None` means the registry has
    /// nothing for us (404).
    async fn next_job(&self) -> Result<Option<RegistryJob>, RegistryError>;

    async fn update_project_status(
        &self,
        project_id: Uuid,
        status: ProjectStatus,
    ) -> Result<(), RegistryError>;

    async fn submit_analysis_result(
        &self,
        project_id: Uuid,
        media_id: Uuid,
        analysis_id: Uuid,
        submission: &AnalysisSubmission,
    ) -> Result<(), RegistryError>;

    async fn submit_report(
        &self,
        project_id: Uuid,
        report: &QualityReport,
    ) -> Result<(), RegistryError>;
}

pub struct HttpJobRegistry {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpJobRegistry {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(RegistryError::Unauthorized);
        }
        if status.is_server_error() {
            return Err(RegistryError::Server(status));
        }
        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Rejected { status, body })
    }
}

#[async_trait]
impl JobRegistry for HttpJobRegistry {
    async fn next_job(&self) -> Result<Option<RegistryJob>, RegistryError> {
        let response = self
            .http
            .get(self.url("/next-job"))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.check(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn update_project_status(
        &self,
        project_id: Uuid,
        status: ProjectStatus,
    ) -> Result<(), RegistryError> {
        let response = self
            .http
            .put(self.url(&format!("/projects/{project_id}/status")))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&ProjectStatusUpdate { status })
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn submit_analysis_result(
        &self,
        project_id: Uuid,
        media_id: Uuid,
        analysis_id: Uuid,
        submission: &AnalysisSubmission,
    ) -> Result<(), RegistryError> {
        let response = self
            .http
            .post(self.url(&format!(
                "/projects/{project_id}/media/{media_id}/analysis/{analysis_id}"
            )))
            .header(API_KEY_HEADER, &self.api_key)
            .json(submission)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn submit_report(
        &self,
        project_id: Uuid,
        report: &QualityReport,
    ) -> Result<(), RegistryError> {
        let response = self
            .http
            .put(self.url(&format!("/projects/{project_id}/reports")))
            .header(API_KEY_HEADER, &self.api_key)
            .json(report)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }
}
