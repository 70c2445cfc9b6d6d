//! Fixed-size worker pool fed by a bounded queue.
//!
//! Backpressure is drop-and-skip: a fire that finds the queue full is
//! discarded and the target simply waits for its next period. A target that
//! already has a job queued or executing is coalesced, so at most one job per
//! target exists anywhere in the pool.
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::models::{CheckResult, TargetId};
use super::probe::ProbeExecutor;
use super::registry::DueJob;

pub const DEFAULT_WORKER_COUNT: usize = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Invalid worker pool configuration: {0}")]
    InvalidConfig(String),
    #[error("Worker pool is shut down")]
    Closed,
}

/// Receives each finished probe. Runs on the worker that executed it, and the
/// target stays in flight until it returns.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: DueJob, result: CheckResult);
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// The target already had a job queued or running.
    Coalesced,
    /// The queue was full; this cycle is skipped.
    Dropped,
}

#[derive(Debug, Default)]
struct PoolCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    coalesced: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub in_flight: usize,
    pub completed: u64,
    /// Jobs whose probe or handler panicked. The worker survives each one.
    pub failed: u64,
    pub dropped: u64,
    pub coalesced: u64,
}

type InFlight = Arc<DashMap<TargetId, String>>;

/// Clears a target's in-flight mark when the job is finished or abandoned.
struct InFlightGuard {
    in_flight: InFlight,
    id: TargetId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

/// Read-only view of a pool's counters that outlives the pool itself.
#[derive(Debug, Clone)]
pub struct PoolMonitor {
    in_flight: InFlight,
    counters: Arc<PoolCounters>,
}

impl PoolMonitor {
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_flight: self.in_flight.len(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerPool {
    sender: mpsc::Sender<DueJob>,
    in_flight: InFlight,
    counters: Arc<PoolCounters>,
    draining: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        config: PoolConfig,
        probe: Arc<dyn ProbeExecutor>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, PoolError> {
        if config.worker_count == 0 {
            return Err(PoolError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if config.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel::<DueJob>(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight: InFlight = Arc::new(DashMap::new());
        let counters = Arc::new(PoolCounters::default());
        let draining = Arc::new(AtomicBool::new(false));

        let workers = (0..config.worker_count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    receiver.clone(),
                    in_flight.clone(),
                    counters.clone(),
                    draining.clone(),
                    probe.clone(),
                    handler.clone(),
                ))
            })
            .collect();

        info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            "Worker pool started."
        );
        Ok(Self {
            sender,
            in_flight,
            counters,
            draining,
            workers,
        })
    }

    /// Enqueues a job without waiting.
    pub fn submit(&self, job: DueJob) -> Result<SubmitOutcome, PoolError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        let id = job.target.id.clone();
        match self.in_flight.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(target_id = %id, job_key = %job.job_key, "Target already in flight; coalescing fire.");
                return Ok(SubmitOutcome::Coalesced);
            }
            Entry::Vacant(slot) => {
                slot.insert(job.job_key.clone());
            }
        }

        match self.sender.try_send(job) {
            Ok(()) => Ok(SubmitOutcome::Accepted),
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.in_flight.remove(&id);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target_id = %id, job_key = %job.job_key, "Work queue full; skipping this check cycle.");
                Ok(SubmitOutcome::Dropped)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.in_flight.remove(&id);
                Err(PoolError::Closed)
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: &TargetId) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn stats(&self) -> PoolStats {
        self.monitor().stats()
    }

    pub fn monitor(&self) -> PoolMonitor {
        PoolMonitor {
            in_flight: self.in_flight.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Stops accepting jobs, discards queued ones and waits for running jobs.
    pub async fn shutdown(self) {
        self.draining.store(true, Ordering::SeqCst);
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task ended abnormally.");
            }
        }
        info!("Worker pool drained.");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<DueJob>>>,
    in_flight: InFlight,
    counters: Arc<PoolCounters>,
    draining: Arc<AtomicBool>,
    probe: Arc<dyn ProbeExecutor>,
    handler: Arc<dyn JobHandler>,
) {
    debug!(worker_id = worker_id, "Worker started.");
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(job) = next else {
            break;
        };
        let _guard = InFlightGuard {
            in_flight: in_flight.clone(),
            id: job.target.id.clone(),
        };
        if draining.load(Ordering::SeqCst) {
            debug!(worker_id = worker_id, target_id = %job.target.id, "Discarding queued job during shutdown.");
            continue;
        }

        // A panic inside the job ends only its own task.
        let target_id = job.target.id.clone();
        let task = tokio::spawn({
            let probe = probe.clone();
            let handler = handler.clone();
            async move {
                let result = probe.execute(&job.target).await;
                handler.handle(job, result).await;
            }
        });
        match task.await {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker_id = worker_id, target_id = %target_id, error = %e, "Check task failed; worker continues.");
            }
        }
    }
    debug!(worker_id = worker_id, "Worker stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::models::MonitoredTarget;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Sleeps for `delay` and tracks how many probes overlap.
    struct SlowProbe {
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowProbe {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProbeExecutor for SlowProbe {
        async fn execute(&self, target: &MonitoredTarget) -> CheckResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            CheckResult::transport_failure(target.id.clone(), self.delay, "timed out".to_string())
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: DueJob, _result: CheckResult) {
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn job(id: &str) -> DueJob {
        let target = MonitoredTarget::new(id, "http://slow.example", Duration::from_secs(1));
        DueJob {
            job_key: format!("check-{id}"),
            target,
            scheduled_for: Instant::now(),
        }
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let result = WorkerPool::spawn(
            PoolConfig {
                worker_count: 0,
                queue_capacity: 4,
            },
            Arc::new(SlowProbe::new(Duration::ZERO)),
            Arc::new(CountingHandler::default()),
        );
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_fires_for_a_slow_target_coalesce() {
        let probe = Arc::new(SlowProbe::new(Duration::from_secs(5)));
        let handler = Arc::new(CountingHandler::default());
        let pool = WorkerPool::spawn(PoolConfig::default(), probe.clone(), handler.clone()).unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..10 {
            outcomes.push(pool.submit(job("a")).unwrap());
            assert!(pool.in_flight() <= 1);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        pool.shutdown().await;

        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes[0], SubmitOutcome::Accepted);
        assert_eq!(outcomes[1], SubmitOutcome::Coalesced);
        let accepted = outcomes
            .iter()
            .filter(|o| **o == SubmitOutcome::Accepted)
            .count();
        assert_eq!(accepted, probe.calls.load(Ordering::SeqCst));
        assert_eq!(handler.handled.load(Ordering::SeqCst), accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_instead_of_growing() {
        let probe = Arc::new(SlowProbe::new(Duration::from_secs(5)));
        let pool = WorkerPool::spawn(
            PoolConfig {
                worker_count: 1,
                queue_capacity: 1,
            },
            probe.clone(),
            Arc::new(CountingHandler::default()),
        )
        .unwrap();

        assert_eq!(pool.submit(job("a")).unwrap(), SubmitOutcome::Accepted);
        // Let the single worker pick up "a" so the queue is empty again.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.submit(job("b")).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(pool.submit(job("c")).unwrap(), SubmitOutcome::Dropped);
        assert!(!pool.is_in_flight(&"c".into()));
        assert_eq!(pool.stats().dropped, 1);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_targets_run_concurrently_up_to_worker_count() {
        let probe = Arc::new(SlowProbe::new(Duration::from_secs(5)));
        let pool = WorkerPool::spawn(
            PoolConfig {
                worker_count: 3,
                queue_capacity: 16,
            },
            probe.clone(),
            Arc::new(CountingHandler::default()),
        )
        .unwrap();

        for id in ["a", "b", "c", "d", "e"] {
            assert_eq!(pool.submit(job(id)).unwrap(), SubmitOutcome::Accepted);
        }
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(probe.peak.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().completed, 5);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_running_jobs_and_discards_queued_ones() {
        let probe = Arc::new(SlowProbe::new(Duration::from_secs(5)));
        let handler = Arc::new(CountingHandler::default());
        let pool = WorkerPool::spawn(
            PoolConfig {
                worker_count: 1,
                queue_capacity: 8,
            },
            probe.clone(),
            handler.clone(),
        )
        .unwrap();

        pool.submit(job("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.submit(job("b")).unwrap();
        pool.shutdown().await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    /// Panics while handling one chosen target.
    struct PanickingHandler {
        poison: TargetId,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, job: DueJob, _result: CheckResult) {
            if job.target.id == self.poison {
                panic!("handler failure for {}", job.target.id);
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_does_not_cost_a_worker() {
        let handler = Arc::new(PanickingHandler {
            poison: "boom".into(),
            handled: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(
            PoolConfig {
                worker_count: 1,
                queue_capacity: 8,
            },
            Arc::new(SlowProbe::new(Duration::from_millis(10))),
            handler.clone(),
        )
        .unwrap();

        pool.submit(job("boom")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!pool.is_in_flight(&"boom".into()));

        // The only worker is still alive to run the next job.
        assert_eq!(pool.submit(job("ok")).unwrap(), SubmitOutcome::Accepted);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }
}
