//! Worker pool draining the work queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::shutdown::ShutdownListener;
use crate::types::Event;

/// Counters shared by all workers of a pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    deleted: AtomicU64,
    already_gone: AtomicU64,
    skipped: AtomicU64,
    requeued: AtomicU64,
    invalid: AtomicU64,
    restarts: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub deleted: u64,
    pub already_gone: u64,
    pub skipped: u64,
    pub requeued: u64,
    pub invalid: u64,
    pub restarts: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            already_gone: self.already_gone.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Take one item off the queue and reconcile it.
///
/// Returns `false` once the queue has shut down and drained.
pub async fn process_next_item(
    queue: &WorkQueue<Event>,
    reconciler: &Reconciler,
    stats: &WorkerStats,
) -> bool {
    let Some(in_flight) = queue.get().await else {
        return false;
    };
    let event = in_flight.item().clone();

    match reconciler.reconcile(&event).await {
        Ok(outcome) => {
            queue.forget(&event);
            match outcome {
                ReconcileOutcome::Deleted => WorkerStats::bump(&stats.deleted),
                ReconcileOutcome::AlreadyGone => WorkerStats::bump(&stats.already_gone),
                ReconcileOutcome::Skipped => WorkerStats::bump(&stats.skipped),
            }
            debug!(event = %event, outcome = ?outcome, "Successfully synced");
        }
        Err(e) if e.is_transient() => {
            queue.add_rate_limited(event.clone());
            WorkerStats::bump(&stats.requeued);
            warn!(
                event = %event,
                error = %e,
                requeues = queue.num_requeues(&event),
                "Error syncing, requeuing"
            );
        }
        Err(e) => {
            queue.forget(&event);
            WorkerStats::bump(&stats.invalid);
            error!(event = ?event, error = %e, "Dropping work item");
        }
    }

    WorkerStats::bump(&stats.processed);
    in_flight.done();
    true
}

async fn run_worker(
    id: usize,
    queue: WorkQueue<Event>,
    reconciler: Reconciler,
    stats: Arc<WorkerStats>,
) {
    debug!(worker = id, "Worker started");
    while process_next_item(&queue, &reconciler, &stats).await {}
    debug!(worker = id, "Worker stopped, queue shut down");
}

/// Keep one worker loop alive, restarting it after a panic.
async fn supervise_worker(
    id: usize,
    queue: WorkQueue<Event>,
    reconciler: Reconciler,
    stats: Arc<WorkerStats>,
    restart_period: Duration,
    shutdown: ShutdownListener,
) {
    loop {
        let worker = tokio::spawn(run_worker(
            id,
            queue.clone(),
            reconciler.clone(),
            Arc::clone(&stats),
        ));

        match worker.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                WorkerStats::bump(&stats.restarts);
                error!(worker = id, "Worker crashed, restarting");
            }
            Err(e) => {
                warn!(worker = id, error = %e, "Worker cancelled");
                return;
            }
        }

        tokio::select! {
            () = tokio::time::sleep(restart_period) => {}
            () = shutdown.cancelled() => {
                debug!(worker = id, "Shutdown requested, not restarting worker");
                return;
            }
        }
    }
}

/// A fixed-size set of supervised workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// Start `count` workers on the current runtime.
    pub fn spawn(
        count: usize,
        queue: &WorkQueue<Event>,
        reconciler: &Reconciler,
        restart_period: Duration,
        shutdown: &ShutdownListener,
    ) -> Self {
        let stats = Arc::new(WorkerStats::default());
        let handles = (0..count)
            .map(|id| {
                tokio::spawn(supervise_worker(
                    id,
                    queue.clone(),
                    reconciler.clone(),
                    Arc::clone(&stats),
                    restart_period,
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(workers = count, "Started workers");
        Self { handles, stats }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for every worker to exit. Workers exit once the queue is shut
    /// down and drained; in-flight items finish first.
    pub async fn join(self) -> WorkerStatsSnapshot {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker supervisor failed");
            }
        }
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::rate_limit::ItemExponentialBackoff;
    use crate::reconciler::InMemoryPodDeleter;
    use crate::shutdown::ShutdownCoordinator;
    use crate::types::ContainerPhase;

    fn queue() -> WorkQueue<Event> {
        WorkQueue::new(ItemExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(20),
        ))
    }

    fn completed(name: &str) -> Event {
        Event::new(
            "default",
            name,
            ContainerPhase::Running,
            ContainerPhase::Terminated,
            "Completed",
        )
    }

    #[tokio::test]
    async fn test_success_forgets_item() {
        let queue = queue();
        let deleter = Arc::new(InMemoryPodDeleter::with_pods([("default", "web-1")]));
        let reconciler = Reconciler::new(deleter.clone());
        let stats = WorkerStats::default();
        let event = completed("web-1");

        queue.add_rate_limited(event.clone());
        assert_eq!(queue.num_requeues(&event), 1);

        assert!(process_next_item(&queue, &reconciler, &stats).await);

        assert_eq!(queue.num_requeues(&event), 0);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(stats.snapshot().deleted, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues() {
        let queue = queue();
        let deleter = Arc::new(
            InMemoryPodDeleter::with_pods([("default", "web-1")]).with_transient_failures(1),
        );
        let reconciler = Reconciler::new(deleter.clone());
        let stats = WorkerStats::default();

        queue.add(completed("web-1"));
        assert!(process_next_item(&queue, &reconciler, &stats).await);
        assert_eq!(stats.snapshot().requeued, 1);

        assert!(process_next_item(&queue, &reconciler, &stats).await);
        assert_eq!(stats.snapshot().deleted, 1);
        assert_eq!(deleter.calls(), 2);
    }

    #[tokio::test]
    async fn test_repeated_failures_then_success_leaves_nothing_behind() {
        let queue = queue();
        let deleter = Arc::new(
            InMemoryPodDeleter::with_pods([("default", "web-1")]).with_transient_failures(3),
        );
        let reconciler = Reconciler::new(deleter.clone());
        let stats = WorkerStats::default();
        let event = completed("web-1");

        queue.add(event.clone());
        for _ in 0..4 {
            assert!(process_next_item(&queue, &reconciler, &stats).await);
        }

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.num_requeues(&event), 0);
        assert_eq!(deleter.calls(), 4);
        assert_eq!(
            deleter.deleted(),
            vec![("default".to_string(), "web-1".to_string())]
        );
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requeued, 3);
        assert_eq!(snapshot.deleted, 1);
    }

    #[tokio::test]
    async fn test_invalid_item_is_dropped() {
        let queue = queue();
        let reconciler = Reconciler::new(Arc::new(InMemoryPodDeleter::new()));
        let stats = WorkerStats::default();

        queue.add(completed(""));
        assert!(process_next_item(&queue, &reconciler, &stats).await);

        assert_eq!(stats.snapshot().invalid, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues(&completed("")), 0);
    }

    #[tokio::test]
    async fn test_pool_drains_and_stops_on_queue_shutdown() {
        let queue = queue();
        let deleter = Arc::new(InMemoryPodDeleter::with_pods([
            ("default", "a"),
            ("default", "b"),
            ("default", "c"),
        ]));
        let reconciler = Reconciler::new(deleter.clone());
        let coordinator = ShutdownCoordinator::new();

        for name in ["a", "b", "c"] {
            queue.add(completed(name));
        }
        let pool = WorkerPool::spawn(
            2,
            &queue,
            &reconciler,
            Duration::from_millis(10),
            &coordinator.listener(),
        );

        queue.shut_down();
        let stats = pool.join().await;

        assert_eq!(stats.deleted, 3);
        assert_eq!(deleter.deleted().len(), 3);
    }
}
