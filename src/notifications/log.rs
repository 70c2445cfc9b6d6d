use async_trait::async_trait;
use tracing::warn;

use super::{NotificationSink, SinkError};
use crate::monitor::models::TransitionEvent;

/// Writes each transition to the log. Used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), SinkError> {
        warn!(
            target_id = %event.target_id,
            event_id = %event.event_id,
            old_status = %event.old_status,
            new_status = %event.new_status,
            "[ALERT] {}",
            event.message()
        );
        Ok(())
    }
}
