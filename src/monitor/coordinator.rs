//! Orchestrates reconciliation, dispatch and transition handling.
//!
//! The coordinator owns the [`ScheduleRegistry`] inside a single task, so
//! every reconcile is serialized. It moves through
//! `STOPPED -> STARTING -> RUNNING -> STOPPED`; jobs are only dispatched while
//! `RUNNING`.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until};
use tracing::{debug, error, info, warn};

use super::dispatch::{
    JobHandler, PoolConfig, PoolError, PoolMonitor, PoolStats, SubmitOutcome, WorkerPool,
};
use super::models::CheckResult;
use super::probe::ProbeExecutor;
use super::registry::{DueJob, ReconcileReport, ScheduleRegistry};
use super::transition::TransitionDetector;
use crate::notifications::{NotificationSink, SinkError};
use crate::store::{StoreError, TargetStore};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

const RELOAD_QUEUE_CAPACITY: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to start worker pool: {0}")]
    Pool(#[from] PoolError),
    #[error("Store error during reconcile: {0}")]
    Store(#[from] StoreError),
    #[error("Scheduler engine is stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub settle_delay: Duration,
    pub reconcile_interval: Duration,
    pub notify_timeout: Duration,
    /// Upper bound on listing targets during a reconcile.
    pub store_timeout: Duration,
    /// Whether the first classification of a `PENDING` target notifies.
    pub notify_on_initial_check: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            notify_on_initial_check: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub state: EngineState,
    pub scheduled_targets: usize,
    pub reconcile_count: u64,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_reconcile_error: Option<String>,
    pub pool: PoolStats,
}

impl EngineHealth {
    fn new(state: EngineState) -> Self {
        Self {
            state,
            scheduled_targets: 0,
            reconcile_count: 0,
            last_reconcile_at: None,
            last_reconcile_error: None,
            pool: PoolStats::default(),
        }
    }
}

type ReloadReply = oneshot::Sender<Result<ReconcileReport, EngineError>>;

pub struct Coordinator {
    config: EngineConfig,
    store: Arc<dyn TargetStore>,
    probe: Arc<dyn ProbeExecutor>,
    sink: Arc<dyn NotificationSink>,
}

impl Coordinator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TargetStore>,
        probe: Arc<dyn ProbeExecutor>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            store,
            probe,
            sink,
        }
    }

    /// Starts the worker pool and the scheduling task.
    ///
    /// Fails only if the worker pool cannot be created. Must be called from
    /// within a tokio runtime.
    pub fn start(self) -> Result<CoordinatorHandle, EngineError> {
        let completion = Arc::new(CheckCompletion {
            detector: TransitionDetector::new(self.store.clone()),
            sink: self.sink,
            notify_timeout: self.config.notify_timeout,
            notify_on_initial_check: self.config.notify_on_initial_check,
        });
        let pool = WorkerPool::spawn(self.config.pool, self.probe, completion)?;
        let monitor = pool.monitor();

        let (health_tx, health_rx) = watch::channel(EngineHealth::new(EngineState::Starting));
        let (reload_tx, reload_rx) = mpsc::channel(RELOAD_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = EngineLoop {
            registry: ScheduleRegistry::new(),
            pool,
            store: self.store,
            health_tx,
            reload_rx,
            shutdown_rx,
            settle_delay: self.config.settle_delay,
            reconcile_interval: self.config.reconcile_interval,
            store_timeout: self.config.store_timeout,
        };
        info!(
            settle_delay_secs = self.config.settle_delay.as_secs(),
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Scheduler engine starting."
        );
        let task = tokio::spawn(engine.run());

        Ok(CoordinatorHandle {
            health: health_rx,
            monitor,
            reload_tx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Control surface of a started engine.
pub struct CoordinatorHandle {
    health: watch::Receiver<EngineHealth>,
    monitor: PoolMonitor,
    reload_tx: mpsc::Sender<ReloadReply>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorHandle {
    pub fn state(&self) -> EngineState {
        self.health.borrow().state
    }

    pub fn health(&self) -> EngineHealth {
        let mut health = self.health.borrow().clone();
        health.pool = self.monitor.stats();
        health
    }

    /// Triggers an out-of-band reconcile and waits for its report.
    ///
    /// A reload requested while the engine is still starting is served right
    /// after the initial reconcile.
    pub async fn reload(&self) -> Result<ReconcileReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.reload_tx
            .send(reply_tx)
            .await
            .map_err(|_| EngineError::Stopped)?;
        reply_rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Resolves once the engine reaches `state`, or immediately if it already has.
    pub async fn wait_for_state(&self, state: EngineState) -> Result<(), EngineError> {
        let mut rx = self.health.clone();
        rx.wait_for(|h| h.state == state)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::Stopped)
    }

    /// Cancels all timers, waits for in-flight checks and returns once stopped.
    pub async fn stop(&self) {
        // A send error only means the loop has already exited.
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task ended abnormally.");
            }
        }
    }
}

/// Runs on the worker after each probe: persist, then notify.
struct CheckCompletion {
    detector: TransitionDetector,
    sink: Arc<dyn NotificationSink>,
    notify_timeout: Duration,
    notify_on_initial_check: bool,
}

#[async_trait]
impl JobHandler for CheckCompletion {
    async fn handle(&self, job: DueJob, result: CheckResult) {
        let event = match self.detector.detect_and_apply(&job.target, &result).await {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(StoreError::NotFound(_)) => {
                debug!(target_id = %job.target.id, job_key = %job.job_key, "Target deleted while its check ran; discarding result.");
                return;
            }
            Err(e) => {
                error!(target_id = %job.target.id, job_key = %job.job_key, error = %e, "Store error; abandoning this check.");
                return;
            }
        };

        if event.is_initial() && !self.notify_on_initial_check {
            debug!(target_id = %event.target_id, new_status = %event.new_status, "Initial classification; notification suppressed.");
            return;
        }

        let outcome = tokio::time::timeout(self.notify_timeout, self.sink.notify(&event))
            .await
            .unwrap_or(Err(SinkError::Timeout));
        match outcome {
            Ok(()) => {
                info!(target_id = %event.target_id, event_id = %event.event_id, "Transition notification sent.")
            }
            Err(e) => {
                warn!(target_id = %event.target_id, event_id = %event.event_id, error = %e, "Failed to deliver transition notification.")
            }
        }
    }
}

struct EngineLoop {
    registry: ScheduleRegistry,
    pool: WorkerPool,
    store: Arc<dyn TargetStore>,
    health_tx: watch::Sender<EngineHealth>,
    reload_rx: mpsc::Receiver<ReloadReply>,
    shutdown_rx: watch::Receiver<bool>,
    settle_delay: Duration,
    reconcile_interval: Duration,
    store_timeout: Duration,
}

impl EngineLoop {
    async fn run(mut self) {
        tokio::select! {
            biased;
            _ = self.shutdown_rx.changed() => {
                info!("Shutdown requested before the engine settled.");
                self.finish().await;
                return;
            }
            _ = sleep(self.settle_delay) => {}
        }

        if let Err(e) = self.reconcile().await {
            error!(error = %e, "Initial reconcile failed; retrying on the next cadence.");
        }
        self.health_tx.send_modify(|h| h.state = EngineState::Running);
        info!(scheduled = self.registry.len(), "Scheduler engine running.");

        let mut cadence = interval_at(
            Instant::now() + self.reconcile_interval,
            self.reconcile_interval,
        );
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.registry.next_deadline();
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping scheduler engine.");
                    break;
                }
                Some(reply) = self.reload_rx.recv() => {
                    info!("Reload requested.");
                    let report = self.reconcile().await;
                    // The requester may have given up waiting.
                    let _ = reply.send(report);
                }
                _ = cadence.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Scheduled reconcile failed.");
                    }
                }
                _ = wait_until(deadline) => {
                    self.dispatch_due();
                }
            }
        }

        self.finish().await;
    }

    async fn reconcile(&mut self) -> Result<ReconcileReport, EngineError> {
        let listed = tokio::time::timeout(self.store_timeout, self.store.list_targets())
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Unavailable(format!(
                    "listing targets timed out after {}s",
                    self.store_timeout.as_secs()
                )))
            });
        let targets = match listed {
            Ok(targets) => targets,
            Err(e) => {
                self.health_tx
                    .send_modify(|h| h.last_reconcile_error = Some(e.to_string()));
                return Err(e.into());
            }
        };

        let report = self.registry.reconcile(&targets, Instant::now());
        let scheduled = self.registry.len();
        self.health_tx.send_modify(|h| {
            h.scheduled_targets = scheduled;
            h.reconcile_count += 1;
            h.last_reconcile_at = Some(Utc::now());
            h.last_reconcile_error = None;
        });
        Ok(report)
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();
        for job in self.registry.pop_due(now) {
            let target_id = job.target.id.clone();
            let lateness = now.saturating_duration_since(job.scheduled_for);
            match self.pool.submit(job) {
                Ok(SubmitOutcome::Accepted) => {
                    debug!(target_id = %target_id, lateness_ms = lateness.as_millis() as u64, "Check dispatched.")
                }
                Ok(SubmitOutcome::Coalesced) | Ok(SubmitOutcome::Dropped) => {}
                Err(e) => {
                    error!(target_id = %target_id, error = %e, "Failed to dispatch check.")
                }
            }
        }
    }

    async fn finish(mut self) {
        self.registry.clear();
        self.health_tx.send_modify(|h| h.scheduled_targets = 0);
        self.pool.shutdown().await;
        self.health_tx.send_modify(|h| h.state = EngineState::Stopped);
        info!("Scheduler engine stopped.");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
