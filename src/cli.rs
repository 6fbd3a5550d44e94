//! CLI flag definitions using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use essential_reconciler::{DEFAULT_DESIGNATION_LABEL, LoopConfig, RateLimitConfig};

/// Deletes pods once their essential container has completed
#[derive(Parser, Debug, Clone)]
#[command(name = "essential-containers")]
#[command(version)]
#[command(
    long_about = "Watches pods carrying the essential-container label. When the container named by that label terminates with reason Completed, the whole pod is deleted."
)]
pub struct Cli {
    /// Path to a kubeconfig. Only required if out-of-cluster
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Address of the Kubernetes API server. Overrides any value in kubeconfig
    #[arg(long)]
    pub master: Option<String>,

    /// Label whose value names the essential container
    #[arg(long, env = "ESSENTIAL_LABEL", default_value = DEFAULT_DESIGNATION_LABEL)]
    pub label: String,

    /// Number of concurrent workers
    #[arg(long, env = "ESSENTIAL_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Only watch this namespace (all namespaces if unset)
    #[arg(short, long, env = "ESSENTIAL_NAMESPACE")]
    pub namespace: Option<String>,

    /// Extra label selector, combined with the label key
    #[arg(long)]
    pub selector: Option<String>,

    /// Cap on the retry backoff for a failing delete, in seconds
    #[arg(long, default_value_t = 1000)]
    pub max_backoff_secs: u64,

    /// Tracing filter directive (falls back to RUST_LOG, then "info")
    #[arg(long)]
    pub log_filter: Option<String>,
}

impl Cli {
    /// Selector for the pod watch: the label must exist, plus any extra terms.
    pub fn label_selector(&self) -> String {
        match self.selector.as_deref().map(str::trim) {
            Some(extra) if !extra.is_empty() => format!("{},{extra}", self.label),
            _ => self.label.clone(),
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig::new()
            .with_label_key(self.label.clone())
            .with_workers(self.workers)
            .with_rate_limit(RateLimitConfig {
                max_delay: Duration::from_secs(self.max_backoff_secs),
                ..RateLimitConfig::default()
            })
    }
}
