//! Process-local target store backed by concurrent maps.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use super::{StoreError, TargetStore};
use crate::monitor::models::{
    CheckLogRecord, MonitoredTarget, TargetId, TargetStatus, TransitionEvent,
};

/// Check-log rows and incidents kept per target unless configured otherwise.
pub const DEFAULT_HISTORY_RETENTION: usize = 1000;

/// History for each target is capped at `retention` rows, oldest evicted first.
#[derive(Debug)]
pub struct MemoryTargetStore {
    targets: DashMap<TargetId, MonitoredTarget>,
    check_logs: DashMap<TargetId, VecDeque<CheckLogRecord>>,
    incidents: DashMap<TargetId, VecDeque<TransitionEvent>>,
    retention: usize,
    available: AtomicBool,
}

impl Default for MemoryTargetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self {
            targets: DashMap::new(),
            check_logs: DashMap::new(),
            incidents: DashMap::new(),
            retention: DEFAULT_HISTORY_RETENTION,
            available: AtomicBool::new(true),
        }
    }

    /// Caps per-target history; a zero value is raised to one row.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn with_targets(targets: impl IntoIterator<Item = MonitoredTarget>) -> Self {
        let store = Self::new();
        for target in targets {
            store.upsert_target(target);
        }
        store
    }

    /// Inserts a target or replaces its definition, keeping any recorded status.
    pub fn upsert_target(&self, target: MonitoredTarget) {
        match self.targets.get_mut(&target.id) {
            Some(mut existing) => {
                existing.name = target.name;
                existing.url = target.url;
                existing.method = target.method;
                existing.interval = target.interval;
            }
            None => {
                self.targets.insert(target.id.clone(), target);
            }
        }
    }

    /// Deletes a target together with its check log and incidents.
    pub fn remove_target(&self, id: &TargetId) -> Option<MonitoredTarget> {
        self.check_logs.remove(id);
        self.incidents.remove(id);
        self.targets.remove(id).map(|(_, target)| target)
    }

    /// Makes the stored definitions match `definitions`; status of surviving targets is kept.
    pub fn sync_definitions(&self, definitions: Vec<MonitoredTarget>) {
        let wanted: HashSet<TargetId> = definitions.iter().map(|t| t.id.clone()).collect();
        let before = self.targets.len();
        self.targets.retain(|id, _| wanted.contains(id));
        self.check_logs.retain(|id, _| wanted.contains(id));
        self.incidents.retain(|id, _| wanted.contains(id));
        let removed = before - self.targets.len();
        for target in definitions {
            self.upsert_target(target);
        }
        info!(
            targets = self.targets.len(),
            removed = removed,
            "Synchronized target definitions."
        );
    }

    pub fn target(&self, id: &TargetId) -> Option<MonitoredTarget> {
        self.targets.get(id).map(|t| t.clone())
    }

    pub fn check_logs(&self, id: &TargetId) -> Vec<CheckLogRecord> {
        self.check_logs
            .get(id)
            .map(|logs| logs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn incidents(&self, id: &TargetId) -> Vec<TransitionEvent> {
        self.incidents
            .get(id)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulates an outage: every call fails with `Unavailable` until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn list_targets(&self) -> Result<Vec<MonitoredTarget>, StoreError> {
        self.ensure_available()?;
        let mut targets: Vec<MonitoredTarget> =
            self.targets.iter().map(|entry| entry.value().clone()).collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(targets)
    }

    async fn get_status(&self, id: &TargetId) -> Result<TargetStatus, StoreError> {
        self.ensure_available()?;
        self.targets
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn record_check(&self, record: CheckLogRecord) -> Result<(), StoreError> {
        self.ensure_available()?;
        debug!(target_id = %record.target_id, status_code = record.status_code, "Recording check.");
        let mut logs = self.check_logs.entry(record.target_id.clone()).or_default();
        push_bounded(&mut *logs, record, self.retention);
        Ok(())
    }

    async fn update_status(
        &self,
        id: &TargetId,
        status: TargetStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut target = self
            .targets
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        target.status = status;
        target.last_checked = Some(checked_at);
        Ok(())
    }

    async fn touch_checked(
        &self,
        id: &TargetId,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut target = self
            .targets
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        target.last_checked = Some(checked_at);
        Ok(())
    }

    async fn record_transition(&self, event: &TransitionEvent) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut events = self.incidents.entry(event.target_id.clone()).or_default();
        push_bounded(&mut *events, event.clone(), self.retention);
        Ok(())
    }
}

fn push_bounded<T>(rows: &mut VecDeque<T>, row: T, retention: usize) {
    while rows.len() >= retention {
        rows.pop_front();
    }
    rows.push_back(row);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target(id: &str, interval_secs: u64) -> MonitoredTarget {
        MonitoredTarget::new(id, format!("http://{id}.example"), Duration::from_secs(interval_secs))
    }

    #[tokio::test]
    async fn sync_keeps_status_and_drops_missing_targets() {
        let store = MemoryTargetStore::with_targets([target("a", 10), target("b", 10)]);
        store
            .update_status(&"a".into(), TargetStatus::Online, Utc::now())
            .await
            .unwrap();

        store.sync_definitions(vec![target("a", 30), target("c", 10)]);

        let ids: Vec<String> = store
            .list_targets()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        let a = store.target(&"a".into()).unwrap();
        assert_eq!(a.status, TargetStatus::Online);
        assert_eq!(a.interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn touch_leaves_status_untouched() {
        let store = MemoryTargetStore::with_targets([target("a", 10)]);
        let now = Utc::now();
        store.touch_checked(&"a".into(), now).await.unwrap();
        let a = store.target(&"a".into()).unwrap();
        assert_eq!(a.status, TargetStatus::Pending);
        assert_eq!(a.last_checked, Some(now));
    }

    #[tokio::test]
    async fn unavailable_store_rejects_every_call() {
        let store = MemoryTargetStore::with_targets([target("a", 10)]);
        store.set_available(false);
        assert!(matches!(
            store.list_targets().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.get_status(&"a".into()).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert_eq!(
            store.get_status(&"a".into()).await,
            Ok(TargetStatus::Pending)
        );
    }

    #[tokio::test]
    async fn unknown_target_is_not_found() {
        let store = MemoryTargetStore::new();
        assert_eq!(
            store.get_status(&"ghost".into()).await,
            Err(StoreError::NotFound("ghost".into()))
        );
    }

    fn check(id: &str, status_code: u16) -> CheckLogRecord {
        CheckLogRecord {
            target_id: id.into(),
            status_code,
            response_time_ms: 5,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn check_log_keeps_only_the_newest_rows() {
        let store = MemoryTargetStore::with_targets([target("a", 10)]).with_retention(3);
        for code in [200, 201, 202, 203, 204] {
            store.record_check(check("a", code)).await.unwrap();
        }

        let codes: Vec<u16> = store
            .check_logs(&"a".into())
            .iter()
            .map(|r| r.status_code)
            .collect();
        assert_eq!(codes, vec![202, 203, 204]);
    }

    #[tokio::test]
    async fn incident_history_is_bounded() {
        let t = target("a", 10);
        let store = MemoryTargetStore::with_targets([t.clone()]).with_retention(2);
        let flips = [
            (TargetStatus::Pending, TargetStatus::Online),
            (TargetStatus::Online, TargetStatus::Offline),
            (TargetStatus::Offline, TargetStatus::Online),
        ];
        for (old, new) in flips {
            let event = TransitionEvent::between(&t, old, new, Utc::now()).unwrap();
            store.record_transition(&event).await.unwrap();
        }

        let incidents = store.incidents(&"a".into());
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].old_status, TargetStatus::Online);
        assert_eq!(incidents[1].new_status, TargetStatus::Online);
    }

    #[tokio::test]
    async fn removing_a_target_drops_its_history() {
        let t = target("a", 10);
        let store = MemoryTargetStore::with_targets([t.clone(), target("b", 10)]);
        store.record_check(check("a", 200)).await.unwrap();
        store.record_check(check("b", 200)).await.unwrap();
        let event =
            TransitionEvent::between(&t, TargetStatus::Pending, TargetStatus::Online, Utc::now())
                .unwrap();
        store.record_transition(&event).await.unwrap();

        store.remove_target(&"a".into());
        assert!(store.check_logs(&"a".into()).is_empty());
        assert!(store.incidents(&"a".into()).is_empty());

        store.sync_definitions(vec![target("c", 10)]);
        assert!(store.check_logs(&"b".into()).is_empty());
    }
}
