use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::json;
use std::time::Duration;
use tera::{Context, Tera};
use tracing::debug;

use super::{NotificationSink, SinkError, event_context};
use crate::monitor::models::TransitionEvent;

/// Pushes transitions to an HTTP endpoint as JSON.
///
/// Template values are inserted raw; use the `json_encode` filter for fields
/// that may contain quotes, e.g. `{"text": {{ name | json_encode() }} }`.
/// A rendered body that is not valid JSON is rejected before sending.
pub struct WebhookSink {
    client: Client,
    url: String,
    body_template: Option<String>,
}

impl WebhookSink {
    pub fn new(
        url: impl Into<String>,
        body_template: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let url = url.into();
        reqwest::Url::parse(&url)
            .map_err(|e| SinkError::InvalidConfiguration(format!("Invalid webhook URL: {e}")))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            body_template,
        })
    }

    fn render_body(&self, event: &TransitionEvent) -> Result<String, SinkError> {
        match &self.body_template {
            Some(template) => {
                let mut tera_context = Context::new();
                for (key, value) in event_context(event) {
                    tera_context.insert(key, &value);
                }
                let body = Tera::one_off(template, &tera_context, false)
                    .map_err(|e| SinkError::TemplatingError(e.to_string()))?;
                serde_json::from_str::<serde_json::Value>(&body).map_err(|e| {
                    SinkError::TemplatingError(format!("Rendered body is not valid JSON: {e}"))
                })?;
                Ok(body)
            }
            None => {
                let payload = json!({
                    "event": "endpoint_status_change",
                    "data": {
                        "endpointId": event.target_id,
                        "name": event.name,
                        "url": event.url,
                        "oldStatus": event.old_status,
                        "newStatus": event.new_status,
                        "timestamp": event.timestamp,
                        "eventId": event.event_id,
                    }
                });
                serde_json::to_string(&payload)
                    .map_err(|e| SinkError::TemplatingError(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), SinkError> {
        let body = self.render_body(event)?;

        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(SinkError::SendFailed(format!(
                "Webhook returned non-success status: {status}. Body: {error_body}"
            )));
        }

        debug!(target_id = %event.target_id, url = %self.url, "Webhook delivered.");
        Ok(())
    }
}
