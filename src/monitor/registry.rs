//! One repeating schedule per target, multiplexed onto a single clock.
//!
//! Entries live in a map keyed by target identity. Fire times live in a
//! min-heap; replacing or cancelling an entry bumps its generation so the
//! stale heap slot is discarded when it surfaces instead of being searched for.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::models::{MonitoredTarget, TargetId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid check interval for target {0}: interval must be positive")]
    InvalidInterval(TargetId),
}

/// Stable job key for a target; re-registering yields the same key.
pub fn job_key(id: &TargetId) -> String {
    format!("check-{id}")
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub job_key: String,
    pub target: MonitoredTarget,
    pub period: Duration,
    generation: u64,
}

/// A timer fire handed to the worker pool.
#[derive(Debug, Clone)]
pub struct DueJob {
    pub job_key: String,
    pub target: MonitoredTarget,
    pub scheduled_for: Instant,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub rejected: Vec<ScheduleError>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

/// Not internally synchronized; the coordinator owns it and serializes
/// every reconcile.
#[derive(Debug, Default)]
pub struct ScheduleRegistry {
    entries: HashMap<TargetId, ScheduleEntry>,
    timeline: BinaryHeap<Reverse<(Instant, u64, TargetId)>>,
    next_generation: u64,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn entry(&self, id: &TargetId) -> Option<&ScheduleEntry> {
        self.entries.get(id)
    }

    pub fn job_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.values().map(|e| e.job_key.clone()).collect();
        keys.sort();
        keys
    }

    /// Number of pending heap slots, stale ones included.
    pub fn pending_fires(&self) -> usize {
        self.timeline.len()
    }

    /// Brings the active entries into agreement with `targets`.
    pub fn reconcile(&mut self, targets: &[MonitoredTarget], now: Instant) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut seen: HashSet<TargetId> = HashSet::with_capacity(targets.len());

        for target in targets {
            if !seen.insert(target.id.clone()) {
                warn!(target_id = %target.id, "Duplicate target in reconcile set; keeping the first definition.");
                continue;
            }
            if target.interval.is_zero() {
                warn!(target_id = %target.id, "Rejecting target with zero check interval.");
                report
                    .rejected
                    .push(ScheduleError::InvalidInterval(target.id.clone()));
                continue;
            }

            match self.entries.get_mut(&target.id) {
                None => {
                    debug!(target_id = %target.id, period_secs = target.interval.as_secs(), "Scheduling new target.");
                    self.arm(target.clone(), now);
                    report.added += 1;
                }
                Some(entry) if entry.period != target.interval => {
                    debug!(
                        target_id = %target.id,
                        old_period_secs = entry.period.as_secs(),
                        new_period_secs = target.interval.as_secs(),
                        "Rescheduling target with new interval."
                    );
                    self.arm(target.clone(), now);
                    report.updated += 1;
                }
                Some(entry) if !entry.target.same_definition(target) => {
                    entry.target = target.clone();
                    report.updated += 1;
                }
                Some(_) => report.unchanged += 1,
            }
        }

        let stale: Vec<TargetId> = self
            .entries
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            self.entries.remove(&id);
            debug!(target_id = %id, "Cancelled schedule for removed target.");
            report.removed += 1;
        }

        self.compact();

        if !report.is_noop() || !report.rejected.is_empty() {
            info!(
                added = report.added,
                updated = report.updated,
                removed = report.removed,
                unchanged = report.unchanged,
                rejected = report.rejected.len(),
                scheduled = self.entries.len(),
                "Schedule reconciled."
            );
        }
        report
    }

    /// Earliest pending fire time, if anything is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeline.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Pops every fire due at `now` and re-arms each entry one period later.
    pub fn pop_due(&mut self, now: Instant) -> Vec<DueJob> {
        let mut due = Vec::new();
        while let Some(Reverse((at, generation, _))) = self.timeline.peek() {
            if *at > now {
                break;
            }
            let (at, generation) = (*at, *generation);
            let Some(Reverse((_, _, id))) = self.timeline.pop() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.generation != generation {
                continue;
            }

            due.push(DueJob {
                job_key: entry.job_key.clone(),
                target: entry.target.clone(),
                scheduled_for: at,
            });

            // Missed periods are skipped rather than replayed.
            let mut next = at + entry.period;
            if next <= now {
                next = now + entry.period;
            }
            self.timeline.push(Reverse((next, generation, id)));
        }
        due
    }

    /// Cancels every entry and pending fire.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.timeline.clear();
    }

    fn arm(&mut self, target: MonitoredTarget, now: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let id = target.id.clone();
        let entry = ScheduleEntry {
            job_key: job_key(&id),
            period: target.interval,
            target,
            generation,
        };
        self.entries.insert(id.clone(), entry);
        self.timeline.push(Reverse((now, generation, id)));
    }

    /// Drops stale heap slots once they outnumber live entries.
    fn compact(&mut self) {
        if self.timeline.len() <= self.entries.len() * 2 + 16 {
            return;
        }
        let entries = &self.entries;
        self.timeline.retain(|Reverse((_, generation, id))| {
            entries
                .get(id)
                .is_some_and(|entry| entry.generation == *generation)
        });
    }
}
