//! Process configuration.
//!
//! Settings come from environment variables; the list of clusters to watch
//! comes from a YAML file named by `CLUSTERS_FILE`.

use crate::error::ControllerError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use watch_job::{ClusterInfo, ConnectionDefaults};

/// Controller settings loaded at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// YAML file holding the cluster list
    pub clusters_file: PathBuf,
    /// Namespace to watch on every cluster (`None` watches all namespaces)
    pub namespace: Option<String>,
    /// Launch grace period
    pub grace_period: Duration,
    /// Connection defaults applied to every cluster
    pub defaults: ConnectionDefaults,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`, which returns the value of a variable if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let clusters_file = lookup("CLUSTERS_FILE")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                ControllerError::InvalidConfig("CLUSTERS_FILE environment variable is required".to_string())
            })?;

        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let grace_period = match lookup("GRACE_PERIOD_SECS") {
            Some(raw) => raw.trim().parse::<u64>().map(Duration::from_secs).map_err(|e| {
                ControllerError::InvalidConfig(format!("GRACE_PERIOD_SECS must be a whole number of seconds: {e}"))
            })?,
            None => watch_job::DEFAULT_GRACE_PERIOD,
        };

        let mut defaults = ConnectionDefaults::default();
        if let Some(user_agent) = lookup("KUBE_USER_AGENT").filter(|ua| !ua.is_empty()) {
            defaults.user_agent = user_agent;
        }

        Ok(Self {
            clusters_file,
            namespace,
            grace_period,
            defaults,
        })
    }
}

/// Load the cluster list from a YAML sequence of cluster entries.
pub fn load_clusters(path: &Path) -> Result<Vec<ClusterInfo>, ControllerError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ControllerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_clusters(&raw).map_err(|source| ControllerError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_clusters(raw: &str) -> Result<Vec<ClusterInfo>, serde_yaml::Error> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(raw)
}
