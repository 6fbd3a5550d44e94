//! Shared helpers for control loop integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use essential_reconciler::{
    ChannelSource, ContainerState, LoopConfig, LoopStats, PodDeleter, PodSnapshot,
    RateLimitConfig, RawWatchEvent, Reconciler, ReconciliationLoop, Result, ShutdownCoordinator,
    ShutdownSignal,
};

pub const NAMESPACE: &str = "default";
pub const LABEL: &str = "essential-container";
pub const ESSENTIAL: &str = "logger";

/// Pod with an `app` and a `logger` container, `logger` designated.
pub fn pod(name: &str, logger: ContainerState) -> PodSnapshot {
    PodSnapshot::new(NAMESPACE, name)
        .with_label(LABEL, ESSENTIAL)
        .with_container("app")
        .with_container(ESSENTIAL)
        .with_status("app", ContainerState::running())
        .with_status(ESSENTIAL, logger)
}

/// Loop settings with millisecond backoff so retries finish quickly.
pub fn fast_config() -> LoopConfig {
    LoopConfig::new()
        .with_workers(2)
        .with_worker_restart_period(Duration::from_millis(10))
        .with_rate_limit(RateLimitConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            ..RateLimitConfig::default()
        })
}

/// A running control loop fed through a delta channel.
pub struct Harness {
    pub deltas: mpsc::Sender<RawWatchEvent>,
    pub coordinator: ShutdownCoordinator,
    pub handle: JoinHandle<Result<LoopStats>>,
}

impl Harness {
    pub fn start(config: LoopConfig, deleter: Arc<dyn PodDeleter>) -> Self {
        let (deltas, rx) = mpsc::channel(64);
        let coordinator = ShutdownCoordinator::new();
        let control_loop = ReconciliationLoop::new(config, Reconciler::new(deleter));
        let handle = tokio::spawn(control_loop.run(ChannelSource::new(rx), coordinator.listener()));

        Self {
            deltas,
            coordinator,
            handle,
        }
    }

    pub async fn send(&self, event: RawWatchEvent) {
        if self.deltas.send(event).await.is_err() {
            panic!("control loop stopped reading deltas");
        }
    }

    /// Deliver an initial list containing `pods` and mark it complete.
    pub async fn initial_list(&self, pods: Vec<PodSnapshot>) {
        self.send(RawWatchEvent::Init).await;
        for pod in pods {
            self.send(RawWatchEvent::InitApply(pod)).await;
        }
        self.send(RawWatchEvent::InitDone).await;
    }

    pub async fn apply(&self, pod: PodSnapshot) {
        self.send(RawWatchEvent::Apply(pod)).await;
    }

    pub async fn stop(self) -> Result<LoopStats> {
        self.coordinator.initiate_shutdown(ShutdownSignal::Programmatic);
        match tokio::time::timeout(Duration::from_secs(5), self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => panic!("control loop task failed: {e}"),
            Err(_) => panic!("control loop did not stop within 5s"),
        }
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), poll).await.is_ok() || check()
}
