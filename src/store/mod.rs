use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::monitor::models::{
    CheckLogRecord, MonitoredTarget, TargetId, TargetStatus, TransitionEvent,
};

pub mod memory;

pub use memory::MemoryTargetStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Target store unavailable: {0}")]
    Unavailable(String),
    #[error("Target not found: {0}")]
    NotFound(TargetId),
}

/// The durable record of targets, their status and their check history.
///
/// The engine reads target definitions through it and is the only writer of
/// status, timestamps and check logs. Any call may fail with
/// [`StoreError::Unavailable`]; callers abandon the current cycle on failure.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<MonitoredTarget>, StoreError>;

    async fn get_status(&self, id: &TargetId) -> Result<TargetStatus, StoreError>;

    /// Appends one immutable check log row.
    async fn record_check(&self, record: CheckLogRecord) -> Result<(), StoreError>;

    /// Writes status and last-checked timestamp as one logical update.
    async fn update_status(
        &self,
        id: &TargetId,
        status: TargetStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Updates only the last-checked timestamp.
    async fn touch_checked(&self, id: &TargetId, checked_at: DateTime<Utc>)
    -> Result<(), StoreError>;

    /// Appends a transition to the incident history.
    async fn record_transition(&self, _event: &TransitionEvent) -> Result<(), StoreError> {
        Ok(())
    }
}
