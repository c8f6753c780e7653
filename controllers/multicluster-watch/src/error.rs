//! Controller-specific error types.
//!
//! Errors of the process entry point that are not covered by the
//! `watch-job` library.

use std::path::PathBuf;
use thiserror::Error;
use watch_job::WatchJobError;

/// Errors that can occur in the multicluster watch controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Watch-job lifecycle error
    #[error("Watch job error: {0}")]
    WatchJob(#[from] WatchJobError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cluster list could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cluster list is not valid YAML
    #[error("Failed to parse {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Waiting for a shutdown or reload signal failed
    #[error("Signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}
