//! Client for the local vision-model runtime (Ollama-style HTTP API on
//! loopback). One client serves both the analysis model and the QA model;
//! the model name travels with each call, taken from the profile.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::profiles::schema::ModelParams;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model runtime error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model runtime returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Timeout(_) => true,
            ModelError::Status { status, .. } => status.is_server_error(),
            ModelError::Http(e) => e.is_connect() || e.is_timeout() || e.status().is_none(),
        }
    }
}

/// One fully rendered generation request.
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub model: String,
    pub system: String,
    pub user: String,
    /// Base64-encoded image payload, when the prompt references one.
    pub image_b64: Option<String>,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: i64,
    pub context_size: i64,
    pub max_output_tokens: i64,
    pub deadline: Duration,
}

impl ModelCall {
    pub fn from_params(params: &ModelParams, deadline_seconds: u64) -> Self {
        Self {
            model: params.name.clone(),
            system: String::new(),
            user: String::new(),
            image_b64: None,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            context_size: params.context_size,
            max_output_tokens: params.max_output_tokens,
            deadline: Duration::from_secs(deadline_seconds),
        }
    }
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Run one generation and return the raw text output.
    async fn generate(&self, call: &ModelCall) -> Result<String, ModelError>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<&'a str>>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_p: f64,
    top_k: i64,
    num_ctx: i64,
    num_predict: i64,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct OllamaClient {
    http: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Quick readiness probe used by the health endpoint.
    pub async fn is_ready(&self) -> bool {
        match self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl VisionModel for OllamaClient {
    async fn generate(&self, call: &ModelCall) -> Result<String, ModelError> {
        let body = GenerateRequest {
            model: &call.model,
            system: &call.system,
            prompt: &call.user,
            images: call.image_b64.as_deref().map(|img| vec![img]),
            stream: false,
            options: GenerateOptions {
                temperature: call.temperature,
                top_p: call.top_p,
                top_k: call.top_k,
                num_ctx: call.context_size,
                num_predict: call.max_output_tokens,
            },
        };
        let request = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send();
        let response = tokio::time::timeout(call.deadline, request)
            .await
            .map_err(|_| ModelError::Timeout(call.deadline))??;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body });
        }
        let parsed: GenerateResponse = response.json().await?;
        Ok(parsed.response)
    }
}
