//! Watch job errors

use thiserror::Error;

/// Errors returned by [`WatchJob`](crate::WatchJob) lifecycle operations.
#[derive(Debug, Error)]
pub enum WatchJobError {
    /// A job without resources has nothing to watch
    #[error("watch resource list is empty")]
    EmptyResourceList,

    /// The connection config for a cluster could not be built
    #[error("failed to derive connection config for cluster {key}: {reason}")]
    ConfigDerivation { key: String, reason: String },

    /// A resource registration or the run loop failed within the grace period
    #[error("watch launch failed for cluster {key}: {source}")]
    Launch {
        key: String,
        #[source]
        source: EngineError,
    },

    /// The job was torn down with `stop_all`
    #[error("watch job has been shut down")]
    ShutDown,
}

impl WatchJobError {
    /// The cluster key the error refers to, if any.
    pub fn cluster_key(&self) -> Option<&str> {
        match self {
            Self::ConfigDerivation { key, .. } | Self::Launch { key, .. } => Some(key),
            Self::EmptyResourceList | Self::ShutDown => None,
        }
    }
}

/// Errors reported by a [`ClusterWatchEngine`](crate::ClusterWatchEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Registering a watch for one resource failed
    #[error("failed to register watch for {resource}: {reason}")]
    Registration { resource: String, reason: String },

    /// The run loop terminated with an error
    #[error("watch run loop failed: {0}")]
    Run(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The connection config could not be turned into a client
    #[error("invalid connection config: {0}")]
    Config(String),
}

/// Error returned by a [`Reconciler`](crate::Reconciler).
#[derive(Debug, Error)]
#[error("reconcile failed: {0}")]
pub struct ReconcileError(pub String);

impl ReconcileError {
    /// Creates a reconcile error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
