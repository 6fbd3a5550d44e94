//! Error types for the reconciler crate.

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Variants fall into four groups, and callers react to the group rather
/// than the individual variant:
///
/// - configuration: [`Error::ContainerNotDeclared`], [`Error::DesignationMissing`]
/// - integrity: [`Error::InvalidItem`]
/// - transient: [`Error::DeleteFailed`]
/// - fatal: [`Error::CacheSyncFailed`], [`Error::SourceFailed`], [`Error::InvalidConfig`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The designated container is not declared in the pod spec.
    #[error(
        "no container named '{container}' in pod {namespace}/{pod}; \
         set the designation label to a declared container name"
    )]
    ContainerNotDeclared {
        pod: String,
        namespace: String,
        container: String,
    },

    /// The pod carries no (or an empty) designation label.
    #[error("pod {namespace}/{pod} has no value for label '{label}'")]
    DesignationMissing {
        pod: String,
        namespace: String,
        label: String,
    },

    /// A dequeued work item does not have the expected shape.
    #[error("invalid work item: {reason}")]
    InvalidItem { reason: String },

    /// Deleting the pod failed for a reason other than "not found".
    #[error("failed to delete pod {namespace}/{name}: {reason}")]
    DeleteFailed {
        namespace: String,
        name: String,
        reason: String,
    },

    /// The watch source never reported its initial list as complete.
    #[error("failed to wait for caches to sync: {reason}")]
    CacheSyncFailed { reason: String },

    /// The watch source stopped with an error.
    #[error("watch source failed: {reason}")]
    SourceFailed { reason: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a container-not-declared error.
    pub fn container_not_declared(
        pod: impl Into<String>,
        namespace: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self::ContainerNotDeclared {
            pod: pod.into(),
            namespace: namespace.into(),
            container: container.into(),
        }
    }

    /// Create a designation-missing error.
    pub fn designation_missing(
        pod: impl Into<String>,
        namespace: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self::DesignationMissing {
            pod: pod.into(),
            namespace: namespace.into(),
            label: label.into(),
        }
    }

    /// Create an invalid item error.
    pub fn invalid_item(reason: impl Into<String>) -> Self {
        Self::InvalidItem {
            reason: reason.into(),
        }
    }

    /// Create a delete failed error.
    pub fn delete_failed(
        namespace: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DeleteFailed {
            namespace: namespace.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a cache sync failed error.
    pub fn cache_sync_failed(reason: impl Into<String>) -> Self {
        Self::CacheSyncFailed {
            reason: reason.into(),
        }
    }

    /// Create a source failed error.
    pub fn source_failed(reason: impl Into<String>) -> Self {
        Self::SourceFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the error stems from pod labels or spec rather than the cluster.
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ContainerNotDeclared { .. } | Self::DesignationMissing { .. }
        )
    }

    /// Whether retrying the same work item later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::DeleteFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::delete_failed("default", "web-1", "connection refused");
        let rendered = err.to_string();
        assert!(rendered.contains("default/web-1"));
        assert!(rendered.contains("connection refused"));
    }

    #[test]
    fn test_container_not_declared_mentions_container() {
        let err = Error::container_not_declared("web-1", "default", "logger");
        assert!(err.to_string().contains("'logger'"));
        assert!(err.is_configuration());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_only_delete_failures_are_transient() {
        assert!(Error::delete_failed("ns", "pod", "boom").is_transient());
        assert!(!Error::invalid_item("empty name").is_transient());
        assert!(!Error::cache_sync_failed("cancelled").is_transient());
        assert!(!Error::invalid_config("workers").is_transient());
    }
}
