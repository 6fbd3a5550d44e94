//! Reconciler implementation.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::Event;

/// What a delete call found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeleteOutcome {
    /// The pod existed and deletion was accepted.
    Deleted,
    /// The pod was already gone.
    AlreadyGone,
}

/// Trait for deleting pods.
///
/// Implementations must be safe to call from several workers at once and
/// must report an absent pod as [`DeleteOutcome::AlreadyGone`], not as an
/// error.
#[async_trait]
pub trait PodDeleter: Send + Sync {
    /// Delete `namespace/name`.
    async fn delete(&self, namespace: &str, name: &str) -> Result<DeleteOutcome>;
}

/// In-memory pod deleter.
///
/// Keeps a set of live pods and a log of accepted deletions. Can be told to
/// fail the next few calls to exercise retry paths.
#[derive(Debug, Default)]
pub struct InMemoryPodDeleter {
    state: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    pods: BTreeSet<(String, String)>,
    deleted: Vec<(String, String)>,
    calls: usize,
    failures_left: usize,
}

impl InMemoryPodDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with live pods given as `(namespace, name)`.
    pub fn with_pods<I, N, P>(pods: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<String>,
    {
        let deleter = Self::new();
        {
            let mut state = deleter.state.lock();
            state
                .pods
                .extend(pods.into_iter().map(|(ns, name)| (ns.into(), name.into())));
        }
        deleter
    }

    /// Fail the next `count` delete calls with a transient error.
    #[must_use]
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.state.lock().failures_left = count;
        self
    }

    pub fn insert(&self, namespace: impl Into<String>, name: impl Into<String>) {
        self.state.lock().pods.insert((namespace.into(), name.into()));
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .pods
            .contains(&(namespace.to_string(), name.to_string()))
    }

    /// Successful deletions, in order.
    pub fn deleted(&self) -> Vec<(String, String)> {
        self.state.lock().deleted.clone()
    }

    /// Every delete call, including failed and already-gone ones.
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }
}

#[async_trait]
impl PodDeleter for InMemoryPodDeleter {
    async fn delete(&self, namespace: &str, name: &str) -> Result<DeleteOutcome> {
        let mut state = self.state.lock();
        state.calls = state.calls.saturating_add(1);

        if state.failures_left > 0 {
            state.failures_left = state.failures_left.saturating_sub(1);
            return Err(Error::delete_failed(namespace, name, "injected failure"));
        }

        let key = (namespace.to_string(), name.to_string());
        if state.pods.remove(&key) {
            state.deleted.push(key);
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::AlreadyGone)
        }
    }
}

/// Result of reconciling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileOutcome {
    /// The pod was deleted.
    Deleted,
    /// The pod no longer existed.
    AlreadyGone,
    /// The event does not call for any action.
    Skipped,
}

/// Deletes the pod behind a successful-completion event.
#[derive(Clone)]
pub struct Reconciler {
    deleter: Arc<dyn PodDeleter>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("deleter", &"<PodDeleter>")
            .finish()
    }
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(deleter: Arc<dyn PodDeleter>) -> Self {
        Self { deleter }
    }

    /// Act on one event.
    ///
    /// The trigger condition is checked again here even though the detector
    /// already filtered: queued events can be stale, and deletion is the one
    /// destructive step.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidItem`] if the event has no pod identity
    /// - [`Error::DeleteFailed`] if the deleter fails (transient)
    pub async fn reconcile(&self, event: &Event) -> Result<ReconcileOutcome> {
        if event.pod_name.is_empty() || event.namespace.is_empty() {
            return Err(Error::invalid_item(format!(
                "event without pod identity: {event:?}"
            )));
        }

        if !event.is_successful_completion() {
            debug!(event = %event, "Not a successful completion, nothing to do");
            return Ok(ReconcileOutcome::Skipped);
        }

        info!(
            pod = %event.pod_name,
            namespace = %event.namespace,
            "Essential container exited, deleting the pod"
        );

        match self.deleter.delete(&event.namespace, &event.pod_name).await {
            Ok(DeleteOutcome::Deleted) => Ok(ReconcileOutcome::Deleted),
            Ok(DeleteOutcome::AlreadyGone) => {
                debug!(event = %event, "Pod already gone");
                Ok(ReconcileOutcome::AlreadyGone)
            }
            Err(Error::DeleteFailed { reason, .. }) => Err(Error::delete_failed(
                &event.namespace,
                &event.pod_name,
                reason,
            )),
            Err(e) => Err(Error::delete_failed(
                &event.namespace,
                &event.pod_name,
                e.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::ContainerPhase;

    fn completed(namespace: &str, name: &str) -> Event {
        Event::new(
            namespace,
            name,
            ContainerPhase::Running,
            ContainerPhase::Terminated,
            "Completed",
        )
    }

    fn setup(pods: &[(&str, &str)]) -> (Reconciler, Arc<InMemoryPodDeleter>) {
        let deleter = Arc::new(InMemoryPodDeleter::with_pods(pods.iter().copied()));
        (Reconciler::new(deleter.clone()), deleter)
    }

    #[tokio::test]
    async fn test_completed_event_deletes_pod() {
        let (reconciler, deleter) = setup(&[("default", "web-1")]);

        let outcome = reconciler.reconcile(&completed("default", "web-1")).await;

        assert_eq!(outcome, Ok(ReconcileOutcome::Deleted));
        assert_eq!(
            deleter.deleted(),
            vec![("default".to_string(), "web-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_idempotent() {
        let (reconciler, deleter) = setup(&[("default", "web-1")]);
        let event = completed("default", "web-1");

        assert_eq!(reconciler.reconcile(&event).await, Ok(ReconcileOutcome::Deleted));
        assert_eq!(
            reconciler.reconcile(&event).await,
            Ok(ReconcileOutcome::AlreadyGone)
        );
        assert_eq!(deleter.deleted().len(), 1);
        assert_eq!(deleter.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_completion_is_skipped_without_delete() {
        let (reconciler, deleter) = setup(&[("default", "web-1")]);
        let event = Event {
            reason: "Error".to_string(),
            ..completed("default", "web-1")
        };

        assert_eq!(reconciler.reconcile(&event).await, Ok(ReconcileOutcome::Skipped));
        assert_eq!(deleter.calls(), 0);
        assert!(deleter.contains("default", "web-1"));
    }

    #[tokio::test]
    async fn test_delete_failure_is_transient() {
        let deleter = Arc::new(
            InMemoryPodDeleter::with_pods([("default", "web-1")]).with_transient_failures(1),
        );
        let reconciler = Reconciler::new(deleter.clone());
        let event = completed("default", "web-1");

        let err = reconciler.reconcile(&event).await.unwrap_err();
        assert!(err.is_transient());

        assert_eq!(reconciler.reconcile(&event).await, Ok(ReconcileOutcome::Deleted));
    }

    #[tokio::test]
    async fn test_event_without_identity_is_invalid() {
        let (reconciler, deleter) = setup(&[]);
        let event = completed("", "web-1");

        let err = reconciler.reconcile(&event).await.unwrap_err();

        assert!(matches!(err, Error::InvalidItem { .. }));
        assert!(!err.is_transient());
        assert_eq!(deleter.calls(), 0);
    }
}
