//! # essential-containers
//!
//! Entry point for the essential container controller.
//!
//! ## Startup Sequence
//!
//! 1. **Flags and tracing** - Parse the command line and install the subscriber
//! 2. **Client** - Load kubeconfig or in-cluster config and connect
//! 3. **Signals** - Route SIGTERM/SIGINT to the `ShutdownCoordinator`
//! 4. **Control loop** - Watch pods, wait for sync, start the workers
//!
//! ## Shutdown
//!
//! The watch stops first, then the work queue drains, then the workers exit.
//! Any startup failure exits non-zero with the cause chain.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use essential_containers::cli::Cli;
use essential_containers::cluster::{KubePodDeleter, KubePodSource, build_config, pod_api};
use essential_reconciler::{
    ReconciliationLoop, Reconciler, ShutdownCoordinator, install_signal_handlers,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_filter.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "essential-containers starting");

    let config = build_config(cli.kubeconfig.as_deref(), cli.master.as_deref())
        .await
        .context("Error building kubeconfig")?;
    let client = kube::Client::try_from(config).context("Error building kubernetes client")?;

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let _signals = install_signal_handlers(Arc::clone(&coordinator))
        .context("Failed to install signal handlers")?;

    let source = KubePodSource::new(
        pod_api(client.clone(), cli.namespace.as_deref()),
        cli.label_selector(),
    );
    let reconciler = Reconciler::new(Arc::new(KubePodDeleter::new(client)));

    let stats = ReconciliationLoop::new(cli.loop_config(), reconciler)
        .run(source, coordinator.listener())
        .await
        .context("Error running controller")?;

    info!(
        stats = %serde_json::to_string(&stats).context("Failed to encode run statistics")?,
        "essential-containers stopped gracefully"
    );
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
///
/// An explicit `--log-filter` wins over `RUST_LOG`.
fn init_tracing(directive: Option<&str>) {
    let filter = directive
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
