//! Kubernetes adapters: pod watch source, pod deleter, client config.

use std::path::Path;
use std::pin::pin;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerState as K8sContainerState, Pod};
use kube::api::{Api, DeleteParams};
use kube::config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Config};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use essential_reconciler::{
    ContainerPhase, ContainerState, DeleteOutcome, Error, PodCache, PodDeleter, PodSnapshot,
    PodWatchSource, RawWatchEvent, Result, ShutdownListener, WatchNotification,
};

/// Errors building the client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    #[error("failed to infer cluster configuration: {0}")]
    Infer(#[from] InferConfigError),

    #[error("invalid master URL {url}: {source}")]
    InvalidMaster {
        url: String,
        source: http::uri::InvalidUri,
    },
}

/// Build the client configuration.
///
/// Uses `kubeconfig` when given, otherwise in-cluster config or the default
/// kubeconfig. `master` replaces the cluster URL.
///
/// # Errors
///
/// Returns an error if no configuration can be loaded or `master` is not a
/// valid URI.
pub async fn build_config(
    kubeconfig: Option<&Path>,
    master: Option<&str>,
) -> std::result::Result<Config, ClusterError> {
    let mut config = match kubeconfig {
        Some(path) => {
            debug!(path = %path.display(), "Loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };

    if let Some(url) = master {
        config.cluster_url = url.parse().map_err(|source| ClusterError::InvalidMaster {
            url: url.to_string(),
            source,
        })?;
    }

    info!(cluster = %config.cluster_url, "Using cluster");
    Ok(config)
}

/// Pod API scoped to one namespace, or to all of them.
pub fn pod_api(client: Client, namespace: Option<&str>) -> Api<Pod> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn state_from(state: Option<&K8sContainerState>) -> ContainerState {
    let Some(state) = state else {
        return ContainerState::default();
    };
    if state.running.is_some() {
        ContainerState::running()
    } else if let Some(waiting) = &state.waiting {
        ContainerState {
            phase: ContainerPhase::Waiting,
            reason: waiting.reason.clone(),
        }
    } else if let Some(terminated) = &state.terminated {
        ContainerState {
            phase: ContainerPhase::Terminated,
            reason: terminated.reason.clone(),
        }
    } else {
        ContainerState::default()
    }
}

/// Reduce a pod object to what the controller looks at.
pub fn snapshot_from_pod(pod: &Pod) -> PodSnapshot {
    let meta = &pod.metadata;
    let mut snapshot = PodSnapshot::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    );
    snapshot.labels = meta.labels.clone().unwrap_or_default();

    if let Some(spec) = &pod.spec {
        snapshot.containers = spec.containers.iter().map(|c| c.name.clone()).collect();
    }

    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref());
    for status in statuses.into_iter().flatten() {
        snapshot = snapshot.with_status(status.name.clone(), state_from(status.state.as_ref()));
    }

    snapshot
}

fn raw_event(event: watcher::Event<Pod>) -> RawWatchEvent {
    match event {
        watcher::Event::Init => RawWatchEvent::Init,
        watcher::Event::InitApply(pod) => RawWatchEvent::InitApply(snapshot_from_pod(&pod)),
        watcher::Event::InitDone => RawWatchEvent::InitDone,
        watcher::Event::Apply(pod) => RawWatchEvent::Apply(snapshot_from_pod(&pod)),
        watcher::Event::Delete(pod) => RawWatchEvent::Delete(snapshot_from_pod(&pod)),
    }
}

/// Watches labelled pods through the API server.
pub struct KubePodSource {
    api: Api<Pod>,
    label_selector: String,
}

impl KubePodSource {
    pub fn new(api: Api<Pod>, label_selector: impl Into<String>) -> Self {
        Self {
            api,
            label_selector: label_selector.into(),
        }
    }
}

#[async_trait]
impl PodWatchSource for KubePodSource {
    async fn run(
        self,
        sink: mpsc::Sender<WatchNotification>,
        shutdown: ShutdownListener,
    ) -> Result<()> {
        info!(selector = %self.label_selector, "Watching pods");

        let config = watcher::Config::default().labels(&self.label_selector);
        let mut stream = pin!(watcher(self.api, config).default_backoff());
        let mut cache = PodCache::new();

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(error = %e, "Pod watch failed, backing off");
                    continue;
                }
                None => return Err(Error::source_failed("pod watch stream ended")),
            };

            for notification in cache.ingest(raw_event(event)) {
                if sink.send(notification).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Deletes pods through the API server.
#[derive(Clone)]
pub struct KubePodDeleter {
    client: Client,
}

impl KubePodDeleter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodDeleter for KubePodDeleter {
    async fn delete(&self, namespace: &str, name: &str) -> Result<DeleteOutcome> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(DeleteOutcome::AlreadyGone),
            Err(e) => Err(Error::delete_failed(namespace, name, e.to_string())),
        }
    }
}
