use thiserror::Error;

/// Errors reported by a [`LogSource`](crate::LogSource)
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("cluster unreachable: {0}")]
    ClusterUnreachable(String),

    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("pod '{namespace}/{pod}' not found")]
    PodNotFound { namespace: String, pod: String },

    #[error("container '{container}' not found in pod '{namespace}/{pod}'")]
    ContainerNotFound {
        namespace: String,
        pod: String,
        container: String,
    },

    #[error("log stream error: {0}")]
    Stream(String),
}

impl SourceError {
    /// The target is gone; retrying the same request cannot succeed
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NamespaceNotFound(_) | Self::PodNotFound { .. } | Self::ContainerNotFound { .. }
        )
    }

    /// Transient failure worth another attempt after backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Stream(_) | Self::ClusterUnreachable(_))
    }
}
