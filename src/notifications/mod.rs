use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::monitor::models::TransitionEvent;

pub mod log;
pub mod webhook;

pub use log::LogSink;
pub use webhook::WebhookSink;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Invalid configuration for sink: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Templating error: {0}")]
    TemplatingError(String),
    #[error("Notification timed out")]
    Timeout,
}

/// Accepts state transitions for delivery. Invoked at most once per
/// transition; a failure is reported to the caller and never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), SinkError>;
}

/// Key/value view of an event used for template rendering.
pub fn event_context(event: &TransitionEvent) -> HashMap<String, String> {
    HashMap::from([
        ("endpointId".to_string(), event.target_id.to_string()),
        ("name".to_string(), event.name.clone()),
        ("url".to_string(), event.url.clone()),
        ("oldStatus".to_string(), event.old_status.to_string()),
        ("newStatus".to_string(), event.new_status.to_string()),
        ("timestamp".to_string(), event.timestamp.to_rfc3339()),
        ("message".to_string(), event.message()),
    ])
}
