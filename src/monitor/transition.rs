use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::models::{CheckLogRecord, CheckResult, MonitoredTarget, TransitionEvent};
use crate::store::{StoreError, TargetStore};

/// Derives status transitions from fresh check results and persists them.
///
/// Callers must not run two detections for the same target concurrently; the
/// worker pool's coalescing guarantees that. Different targets are independent.
pub struct TransitionDetector {
    store: Arc<dyn TargetStore>,
}

impl TransitionDetector {
    pub fn new(store: Arc<dyn TargetStore>) -> Self {
        Self { store }
    }

    /// Records the check and, when the classification changed, the new status.
    ///
    /// Returns the transition only after the status write has succeeded. Any
    /// store failure abandons this check; nothing is retried here.
    pub async fn detect_and_apply(
        &self,
        target: &MonitoredTarget,
        result: &CheckResult,
    ) -> Result<Option<TransitionEvent>, StoreError> {
        let previous = self.store.get_status(&target.id).await?;
        let checked_at = Utc::now();

        self.store
            .record_check(CheckLogRecord::from_result(result, checked_at))
            .await?;

        let Some(event) =
            TransitionEvent::between(target, previous, result.classification, checked_at)
        else {
            self.store.touch_checked(&target.id, checked_at).await?;
            debug!(target_id = %target.id, status = %previous, "Status unchanged.");
            return Ok(None);
        };

        self.store
            .update_status(&target.id, event.new_status, checked_at)
            .await?;
        info!(
            target_id = %target.id,
            old_status = %event.old_status,
            new_status = %event.new_status,
            status_code = result.status_code,
            "Target status changed."
        );

        if let Err(e) = self.store.record_transition(&event).await {
            warn!(target_id = %target.id, error = %e, "Failed to record incident history.");
        }
        Ok(Some(event))
    }
}
