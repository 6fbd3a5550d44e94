//! The control loop: watch source -> detector -> work queue -> workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{PodCache, RawWatchEvent, WatchNotification};
use crate::detector::{designation, detect};
use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::rate_limit::RateLimitConfig;
use crate::reconciler::Reconciler;
use crate::shutdown::ShutdownListener;
use crate::types::{DEFAULT_DESIGNATION_LABEL, Event};
use crate::worker::{WorkerPool, WorkerStatsSnapshot};

/// Supplies pod update notifications to the control loop.
///
/// Implementations push [`WatchNotification`]s into `sink` until `shutdown`
/// fires or the sink is closed, and must send
/// [`WatchNotification::Synced`] once the initial list has been delivered.
#[async_trait]
pub trait PodWatchSource: Send + 'static {
    /// Run until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot continue watching.
    async fn run(
        self,
        sink: mpsc::Sender<WatchNotification>,
        shutdown: ShutdownListener,
    ) -> Result<()>;
}

/// A watch source fed with raw list/watch deltas over a channel.
///
/// Pairs deltas into updates with a [`PodCache`]. Stops when the sending side
/// is dropped or on shutdown.
#[derive(Debug)]
pub struct ChannelSource {
    deltas: mpsc::Receiver<RawWatchEvent>,
}

impl ChannelSource {
    pub fn new(deltas: mpsc::Receiver<RawWatchEvent>) -> Self {
        Self { deltas }
    }
}

#[async_trait]
impl PodWatchSource for ChannelSource {
    async fn run(
        mut self,
        sink: mpsc::Sender<WatchNotification>,
        shutdown: ShutdownListener,
    ) -> Result<()> {
        let mut cache = PodCache::new();
        loop {
            let delta = tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                delta = self.deltas.recv() => delta,
            };
            let Some(delta) = delta else {
                return Ok(());
            };
            for notification in cache.ingest(delta) {
                if sink.send(notification).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Configuration for the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Label whose value names the essential container.
    pub label_key: String,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Pause before restarting a crashed worker.
    pub worker_restart_period: Duration,
    /// Capacity of the channel between watch source and detector.
    pub notification_buffer: usize,
    /// Requeue backoff for failed deletes.
    pub rate_limit: RateLimitConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            label_key: DEFAULT_DESIGNATION_LABEL.to_string(),
            workers: 2,
            worker_restart_period: Duration::from_secs(1),
            notification_buffer: 256,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_label_key(mut self, label_key: impl Into<String>) -> Self {
        self.label_key = label_key.into();
        self
    }

    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn with_worker_restart_period(mut self, period: Duration) -> Self {
        self.worker_restart_period = period;
        self
    }

    #[must_use]
    pub const fn with_notification_buffer(mut self, capacity: usize) -> Self {
        self.notification_buffer = capacity;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Check the configuration before anything is started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.label_key.trim().is_empty() {
            return Err(Error::invalid_config("label key must not be empty"));
        }
        if self.workers == 0 {
            return Err(Error::invalid_config("at least one worker is required"));
        }
        if self.notification_buffer == 0 {
            return Err(Error::invalid_config("notification buffer must not be zero"));
        }
        if self.worker_restart_period.is_zero() {
            return Err(Error::invalid_config("worker restart period must not be zero"));
        }
        self.rate_limit.validate()
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    updates: AtomicU64,
    enqueued: AtomicU64,
    configuration_errors: AtomicU64,
}

/// Statistics for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// Update notifications received from the watch source.
    pub updates_seen: u64,
    /// Events handed to the work queue.
    pub events_enqueued: u64,
    /// Updates skipped because of a bad designation.
    pub configuration_errors: u64,
    /// Worker outcomes.
    pub workers: WorkerStatsSnapshot,
}

/// Wires a watch source to the work queue and worker pool.
#[derive(Debug)]
pub struct ReconciliationLoop {
    config: LoopConfig,
    reconciler: Reconciler,
}

impl ReconciliationLoop {
    /// Create a new reconciliation loop.
    pub fn new(config: LoopConfig, reconciler: Reconciler) -> Self {
        Self { config, reconciler }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run until `shutdown` fires.
    ///
    /// Starts the source, waits for its initial sync, then starts the
    /// workers. On shutdown the source is stopped first, then the queue is
    /// shut down and drained, then the workers are joined.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if the configuration is invalid
    /// - [`Error::CacheSyncFailed`] if shutdown arrives, or the source stops,
    ///   before the initial sync
    /// - [`Error::SourceFailed`] if the source stops on its own after sync
    pub async fn run<S: PodWatchSource>(
        self,
        source: S,
        shutdown: ShutdownListener,
    ) -> Result<LoopStats> {
        self.config.validate()?;

        let queue: WorkQueue<Event> = WorkQueue::from_config(&self.config.rate_limit)?;
        let (sink, notifications) = mpsc::channel(self.config.notification_buffer);
        let (synced_tx, mut synced_rx) = watch::channel(false);
        let counters = Arc::new(DispatchCounters::default());

        info!(
            label = %self.config.label_key,
            workers = self.config.workers,
            "Starting essential container controller"
        );

        let mut source_task = tokio::spawn(source.run(sink, shutdown.clone()));
        let dispatcher = tokio::spawn(dispatch(
            notifications,
            queue.clone(),
            self.config.label_key.clone(),
            synced_tx,
            Arc::clone(&counters),
        ));

        info!("Waiting for informer caches to sync");
        let synced = tokio::select! {
            res = synced_rx.wait_for(|synced| *synced) => res.is_ok(),
            () = shutdown.cancelled() => false,
        };

        if !synced {
            let source_result = join_source(source_task).await;
            queue.shut_down();
            join_dispatcher(dispatcher).await;

            let reason = match source_result {
                Err(e) => e.to_string(),
                Ok(()) if shutdown.is_cancelled() => {
                    "shutdown requested before initial sync".to_string()
                }
                Ok(()) => "watch source stopped before initial sync".to_string(),
            };
            error!(reason = %reason, "Failed to wait for caches to sync");
            return Err(Error::cache_sync_failed(reason));
        }

        info!("Starting workers");
        let pool = WorkerPool::spawn(
            self.config.workers,
            &queue,
            &self.reconciler,
            self.config.worker_restart_period,
            &shutdown,
        );

        let stopped_early = tokio::select! {
            res = &mut source_task => Some(flatten_join(res)),
            () = shutdown.cancelled() => None,
        };

        info!("Shutting down workers");
        let source_result = match stopped_early {
            Some(res) => res.and_then(|()| {
                if shutdown.is_cancelled() {
                    Ok(())
                } else {
                    Err(Error::source_failed("watch source ended unexpectedly"))
                }
            }),
            None => join_source(source_task).await,
        };

        join_dispatcher(dispatcher).await;
        queue.shut_down();
        let workers = pool.join().await;

        let stats = LoopStats {
            updates_seen: counters.updates.load(Ordering::Relaxed),
            events_enqueued: counters.enqueued.load(Ordering::Relaxed),
            configuration_errors: counters.configuration_errors.load(Ordering::Relaxed),
            workers,
        };
        info!(
            updates = stats.updates_seen,
            enqueued = stats.events_enqueued,
            deleted = stats.workers.deleted,
            "Controller stopped"
        );

        source_result.map(|()| stats)
    }
}

fn flatten_join(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    res.map_err(|e| Error::source_failed(e.to_string()))?
}

async fn join_source(task: JoinHandle<Result<()>>) -> Result<()> {
    flatten_join(task.await)
}

async fn join_dispatcher(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!(error = %e, "Dispatcher task failed");
    }
}

/// Turn notifications into queued events.
async fn dispatch(
    mut notifications: mpsc::Receiver<WatchNotification>,
    queue: WorkQueue<Event>,
    label_key: String,
    synced_tx: watch::Sender<bool>,
    counters: Arc<DispatchCounters>,
) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            WatchNotification::Synced => {
                debug!("Initial list delivered");
                synced_tx.send_replace(true);
            }
            WatchNotification::Updated { old, new } => {
                counters.updates.fetch_add(1, Ordering::Relaxed);

                match designation(&new, &label_key).and_then(|name| detect(&old, &new, name)) {
                    Ok(Some(event)) => {
                        debug!(event = %event, "Queueing event");
                        counters.enqueued.fetch_add(1, Ordering::Relaxed);
                        queue.add(event);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        counters.configuration_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Skipping pod update");
                    }
                }
            }
        }
    }
    debug!("Notification channel closed");
}
