//! Graceful shutdown handling for the control loop.
//!
//! A single [`ShutdownCoordinator`] owns the cancellation signal. Every task
//! holds a [`ShutdownListener`] and unwinds once the signal is raised, either
//! programmatically or by SIGTERM/SIGINT.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::Result;

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
    /// SIGTERM signal received
    Sigterm,
    /// SIGINT signal received (Ctrl+C)
    Sigint,
    /// Programmatic shutdown requested
    Programmatic,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
        }
    }
}

/// Owner of the cancellation signal.
pub struct ShutdownCoordinator {
    /// Whether shutdown has been initiated
    shutdown_initiated: AtomicBool,
    /// Latest signal, `None` while running
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        let (signal_tx, _) = watch::channel(None);
        Self {
            shutdown_initiated: AtomicBool::new(false),
            signal_tx,
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Hand out a listener for a task that must stop on shutdown.
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            signal_rx: self.signal_tx.subscribe(),
        }
    }

    /// Raise the shutdown signal. Duplicate signals are ignored.
    pub fn initiate_shutdown(&self, signal: ShutdownSignal) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Shutdown already in progress, ignoring duplicate signal");
            return;
        }

        info!(
            signal = %signal,
            listeners = self.signal_tx.receiver_count(),
            "Initiating graceful shutdown"
        );
        self.signal_tx.send_replace(Some(signal));
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the shutdown signal. Cheap to clone.
///
/// Dropping the coordinator counts as shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownListener {
    /// Resolve once shutdown has been initiated.
    pub async fn cancelled(&self) {
        let mut signal_rx = self.signal_rx.clone();
        // Err means the coordinator is gone
        let _ = signal_rx.wait_for(Option::is_some).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal_rx.borrow().is_some() || self.signal_rx.has_changed().is_err()
    }

    /// The signal that triggered shutdown, if any.
    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.signal_rx.borrow()
    }
}

/// Install OS signal handlers (SIGTERM, SIGINT)
///
/// # Errors
///
/// Returns an error if a handler cannot be registered.
pub fn install_signal_handlers(
    coordinator: Arc<ShutdownCoordinator>,
) -> Result<tokio::task::JoinHandle<()>> {
    info!("Installing OS signal handlers");

    #[cfg(unix)]
    let handle = {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            crate::Error::invalid_config(format!("failed to install SIGTERM handler: {e}"))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            crate::Error::invalid_config(format!("failed to install SIGINT handler: {e}"))
        })?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    coordinator.initiate_shutdown(ShutdownSignal::Sigterm);
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    coordinator.initiate_shutdown(ShutdownSignal::Sigint);
                }
            }
        })
    };

    #[cfg(not(unix))]
    let handle = tokio::spawn(async move {
        // Windows doesn't have SIGTERM, only SIGINT (Ctrl+C)
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }

        info!("Received Ctrl+C");
        coordinator.initiate_shutdown(ShutdownSignal::Sigint);
    });

    Ok(handle)
}
