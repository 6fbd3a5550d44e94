//! Core types for the reconciler.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Termination reason the kubelet reports for a container that exited 0.
pub const COMPLETED_REASON: &str = "Completed";

/// Label whose value names the essential container of a pod.
pub const DEFAULT_DESIGNATION_LABEL: &str = "essential-container";

/// Lifecycle phase of a single container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerPhase {
    /// Not yet running (image pull, crash-loop back-off, ...).
    Waiting,
    /// Started and not yet exited.
    Running,
    /// Exited, successfully or not.
    Terminated,
    /// No status reported for the container yet.
    #[default]
    Unknown,
}

impl ContainerPhase {
    /// All phases, in declaration order.
    pub const ALL: [Self; 4] = [Self::Waiting, Self::Running, Self::Terminated, Self::Unknown];
}

impl fmt::Display for ContainerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::Running => write!(f, "Running"),
            Self::Terminated => write!(f, "Terminated"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Observed state of a container: its phase plus the reason, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub phase: ContainerPhase,
    pub reason: Option<String>,
}

impl ContainerState {
    pub fn running() -> Self {
        Self {
            phase: ContainerPhase::Running,
            reason: None,
        }
    }

    pub fn waiting(reason: impl Into<String>) -> Self {
        Self {
            phase: ContainerPhase::Waiting,
            reason: Some(reason.into()),
        }
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self {
            phase: ContainerPhase::Terminated,
            reason: Some(reason.into()),
        }
    }

    /// Reason as reported, or an empty string.
    pub fn reason_or_empty(&self) -> &str {
        self.reason.as_deref().unwrap_or_default()
    }
}

/// Status entry for one named container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: ContainerState,
}

/// The parts of a pod the controller looks at.
///
/// Built from the cluster's pod objects by the watch adapter, or by hand in
/// tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    /// Container names declared in the pod spec.
    pub containers: Vec<String>,
    /// Container statuses reported by the kubelet.
    pub statuses: Vec<ContainerStatus>,
}

impl PodSnapshot {
    /// Create an empty snapshot for `namespace/name`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_container(mut self, name: impl Into<String>) -> Self {
        self.containers.push(name.into());
        self
    }

    /// Add or replace the status of container `name`.
    #[must_use]
    pub fn with_status(mut self, name: impl Into<String>, state: ContainerState) -> Self {
        let name = name.into();
        self.statuses.retain(|s| s.name != name);
        self.statuses.push(ContainerStatus { name, state });
        self
    }

    /// `namespace/name`, the key used by caches and logs.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn declares(&self, container: &str) -> bool {
        self.containers.iter().any(|c| c == container)
    }

    /// State of `container`, defaulting to [`ContainerPhase::Unknown`].
    pub fn container_state(&self, container: &str) -> ContainerState {
        self.statuses
            .iter()
            .rev()
            .find(|s| s.name == container)
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }
}

/// A detected state change of a pod's essential container.
///
/// The whole value is the work queue's dedup key: two events for the same
/// pod with different phases or reasons are distinct queue entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub pod_name: String,
    pub namespace: String,
    pub old_phase: ContainerPhase,
    pub new_phase: ContainerPhase,
    pub reason: String,
}

impl Event {
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        old_phase: ContainerPhase,
        new_phase: ContainerPhase,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            pod_name: pod_name.into(),
            namespace: namespace.into(),
            old_phase,
            new_phase,
            reason: reason.into(),
        }
    }

    /// Running -> Terminated with the completed sentinel.
    pub fn is_successful_completion(&self) -> bool {
        is_successful_completion(self.old_phase, self.new_phase, &self.reason)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({} -> {}",
            self.namespace, self.pod_name, self.old_phase, self.new_phase
        )?;
        if self.reason.is_empty() {
            write!(f, ")")
        } else {
            write!(f, ", {})", self.reason)
        }
    }
}

/// The trigger condition shared by the detector and the reconciler.
pub fn is_successful_completion(old: ContainerPhase, new: ContainerPhase, reason: &str) -> bool {
    old == ContainerPhase::Running && new == ContainerPhase::Terminated && reason == COMPLETED_REASON
}
