//! Best-effort webhook notifications. Delivery failures are logged and
//! dropped; nothing in the pipeline ever waits on a webhook.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotifyChannel {
    BatchManifest,
    QaStructural,
    QaContent,
    QaDomain,
    BatchReport,
}

#[derive(Debug, Serialize)]
struct WebhookEnvelope<'a> {
    channel: NotifyChannel,
    payload: &'a serde_json::Value,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a notification; must not fail the caller.
    async fn notify(&self, channel: NotifyChannel, payload: serde_json::Value);
}

/// POSTs every notification to a single configured webhook URL. When no
/// URL is configured the sink is a no-op.
pub struct WebhookSink {
    http: Client,
    url: Option<String>,
}

impl WebhookSink {
    pub fn new(url: Option<String>) -> Self {
        Self {
            http: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, channel: NotifyChannel, payload: serde_json::Value) {
        let Some(url) = &self.url else {
            return;
        };
        let envelope = WebhookEnvelope {
            channel,
            payload: &payload,
        };
        match self.http.post(url).json(&envelope).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(%channel, status = %response.status(), "webhook delivery rejected");
            }
            Err(e) => {
                tracing::warn!(%channel, error = %e, "webhook delivery failed");
            }
        }
    }
}
