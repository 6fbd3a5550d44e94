//! K8s-style control loop that deletes a pod once its essential container
//! completes.
//!
//! A pod names one of its containers as "essential" through a label. When
//! that container goes from `Running` to `Terminated` with reason
//! `Completed`, the pod is deleted instead of being left behind with its
//! sidecars still running.
//!
//! # Pipeline
//!
//! 1. A [`PodWatchSource`] delivers `(old, new)` pod snapshot pairs, usually
//!    through a [`PodCache`] fed by a list/watch stream.
//! 2. The detector ([`detect`]) turns a qualifying transition into an
//!    [`Event`].
//! 3. Events go into a deduplicating, rate-limited [`WorkQueue`].
//! 4. A [`WorkerPool`] drains the queue; the [`Reconciler`] deletes the pod
//!    through a [`PodDeleter`].
//!
//! Failed deletes are requeued with per-item exponential backoff. The whole
//! pipeline stops on a single [`ShutdownCoordinator`] signal.
//!
//! # Example
//!
//! ```ignore
//! use essential_reconciler::{
//!     ChannelSource, InMemoryPodDeleter, LoopConfig, Reconciler, ReconciliationLoop,
//!     ShutdownCoordinator,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> essential_reconciler::Result<()> {
//!     let (deltas_tx, deltas_rx) = tokio::sync::mpsc::channel(16);
//!     let coordinator = ShutdownCoordinator::new();
//!     let reconciler = Reconciler::new(Arc::new(InMemoryPodDeleter::new()));
//!
//!     let stats = ReconciliationLoop::new(LoopConfig::default(), reconciler)
//!         .run(ChannelSource::new(deltas_rx), coordinator.listener())
//!         .await?;
//!     println!("{stats:?}");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cache;
pub mod detector;
pub mod error;
pub mod r#loop;
pub mod queue;
pub mod rate_limit;
pub mod reconciler;
pub mod shutdown;
pub mod types;
pub mod worker;

// Re-export main types
pub use cache::{PodCache, RawWatchEvent, WatchNotification};
pub use detector::{designation, detect};
pub use error::{Error, Result};
pub use r#loop::{ChannelSource, LoopConfig, LoopStats, PodWatchSource, ReconciliationLoop};
pub use queue::{InFlight, WorkQueue};
pub use rate_limit::{ItemExponentialBackoff, RateLimitConfig, RateLimiter, TokenBucket};
pub use reconciler::{DeleteOutcome, InMemoryPodDeleter, PodDeleter, ReconcileOutcome, Reconciler};
pub use shutdown::{ShutdownCoordinator, ShutdownListener, ShutdownSignal, install_signal_handlers};
pub use types::{
    COMPLETED_REASON, ContainerPhase, ContainerState, ContainerStatus, DEFAULT_DESIGNATION_LABEL,
    Event, PodSnapshot,
};
pub use worker::{WorkerPool, WorkerStats, WorkerStatsSnapshot};
