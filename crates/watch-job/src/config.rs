//! Per-cluster connection configuration.
//!
//! A [`ConnectionConfig`] is derived once per cluster key from the caller's
//! [`ClusterInfo`] and the job-wide [`ConnectionDefaults`], then cached by the
//! orchestrator. Derivation is cheap and side-effect free.
//!
//! Transport security is fixed: the bearer token authenticates the client and
//! server certificates are not verified (`insecure` is always `true`).

use crate::cluster::ClusterInfo;
use crate::error::WatchJobError;
use http::Uri;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection settings applied to every derived [`ConnectionConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionDefaults {
    /// API path prefix for the multicluster group (e.g. "/apis")
    pub api_path: String,

    /// Group/version served under `api_path` (e.g. "multicluster.io/v1alpha1")
    pub group_version: String,

    /// User agent sent with every request
    pub user_agent: String,

    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Read timeout in seconds (must exceed the server's watch timeout)
    pub read_timeout_secs: u64,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            api_path: "/apis".to_string(),
            group_version: "multicluster.io/v1alpha1".to_string(),
            user_agent: concat!("watch-job/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
            read_timeout_secs: 295,
        }
    }
}

/// Resolved parameters needed to talk to one cluster's API server.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Cluster key this config was derived for
    pub key: String,
    /// API server URL
    pub host: Uri,
    /// Bearer token
    pub bearer_token: String,
    /// API path prefix
    pub api_path: String,
    /// Group/version under `api_path`
    pub group_version: String,
    /// User agent
    pub user_agent: String,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Read timeout
    pub read_timeout: Duration,
    /// Skip server certificate verification
    pub insecure: bool,
}

impl ConnectionConfig {
    /// Derive a connection config for `cluster` on top of `defaults`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchJobError::ConfigDerivation`] when the cluster key is
    /// empty or the endpoint is not an absolute `http(s)` URL.
    pub fn derive(cluster: &ClusterInfo, defaults: &ConnectionDefaults) -> Result<Self, WatchJobError> {
        let fail = |reason: String| WatchJobError::ConfigDerivation {
            key: cluster.key.clone(),
            reason,
        };

        if cluster.key.trim().is_empty() {
            return Err(fail("cluster key must not be empty".to_string()));
        }

        let host: Uri = cluster
            .endpoint
            .trim()
            .parse()
            .map_err(|e| fail(format!("invalid endpoint {:?}: {}", cluster.endpoint, e)))?;
        match host.scheme_str() {
            Some("https" | "http") => {}
            _ => {
                return Err(fail(format!(
                    "endpoint {:?} must use http or https",
                    cluster.endpoint
                )));
            }
        }
        if host.authority().is_none() {
            return Err(fail(format!("endpoint {:?} has no host", cluster.endpoint)));
        }

        Ok(Self {
            key: cluster.key.clone(),
            host,
            bearer_token: cluster.token.clone(),
            api_path: defaults.api_path.clone(),
            group_version: defaults.group_version.clone(),
            user_agent: defaults.user_agent.clone(),
            connect_timeout: Duration::from_secs(defaults.connect_timeout_secs),
            read_timeout: Duration::from_secs(defaults.read_timeout_secs),
            insecure: true,
        })
    }

    /// Base URL of the multicluster API group on this cluster.
    pub fn api_base(&self) -> String {
        let host = self.host.to_string();
        let host = host.trim_end_matches('/');
        let path = self.api_path.trim_matches('/');
        let group_version = self.group_version.trim_matches('/');
        match (path.is_empty(), group_version.is_empty()) {
            (true, true) => host.to_string(),
            (true, false) => format!("{host}/{group_version}"),
            (false, true) => format!("{host}/{path}"),
            (false, false) => format!("{host}/{path}/{group_version}"),
        }
    }

    /// Whether this config was derived from the same endpoint and token as `cluster`.
    pub fn matches(&self, cluster: &ClusterInfo) -> bool {
        self.key == cluster.key
            && self.bearer_token == cluster.token
            && self.host.to_string().trim_end_matches('/') == cluster.endpoint.trim().trim_end_matches('/')
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("key", &self.key)
            .field("host", &self.host)
            .field("bearer_token", &"<redacted>")
            .field("api_path", &self.api_path)
            .field("group_version", &self.group_version)
            .field("user_agent", &self.user_agent)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("insecure", &self.insecure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(endpoint: &str, key: &str) -> ClusterInfo {
        ClusterInfo::new(endpoint, "token-1", key)
    }

    #[test]
    fn test_derive_applies_defaults() {
        let defaults = ConnectionDefaults {
            user_agent: "test-agent".to_string(),
            ..Default::default()
        };
        let cfg = ConnectionConfig::derive(&cluster("https://10.0.0.1:6443", "c1"), &defaults).unwrap();

        assert_eq!(cfg.key, "c1");
        assert_eq!(cfg.bearer_token, "token-1");
        assert_eq!(cfg.user_agent, "test-agent");
        assert_eq!(cfg.api_path, "/apis");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
        assert!(cfg.insecure, "insecure transport is the only supported mode");
    }

    #[test]
    fn test_derive_rejects_empty_key() {
        let err = ConnectionConfig::derive(&cluster("https://10.0.0.1:6443", "  "), &ConnectionDefaults::default())
            .unwrap_err();
        assert!(matches!(err, WatchJobError::ConfigDerivation { .. }));
    }

    #[test]
    fn test_derive_rejects_bad_endpoints() {
        for endpoint in ["", "not a url", "10.0.0.1:6443", "ftp://10.0.0.1", "/relative/path"] {
            let result = ConnectionConfig::derive(&cluster(endpoint, "c1"), &ConnectionDefaults::default());
            assert!(
                matches!(result, Err(WatchJobError::ConfigDerivation { ref key, .. }) if key == "c1"),
                "endpoint {endpoint:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_api_base() {
        let cfg = ConnectionConfig::derive(&cluster("https://10.0.0.1:6443/", "c1"), &ConnectionDefaults::default())
            .unwrap();
        assert_eq!(cfg.api_base(), "https://10.0.0.1:6443/apis/multicluster.io/v1alpha1");

        let bare = ConnectionDefaults {
            api_path: String::new(),
            group_version: String::new(),
            ..Default::default()
        };
        let cfg = ConnectionConfig::derive(&cluster("https://10.0.0.1:6443", "c1"), &bare).unwrap();
        assert_eq!(cfg.api_base(), "https://10.0.0.1:6443");
    }

    #[test]
    fn test_matches_detects_changed_connection() {
        let info = cluster("https://10.0.0.1:6443", "c1");
        let cfg = ConnectionConfig::derive(&info, &ConnectionDefaults::default()).unwrap();
        assert!(cfg.matches(&info));
        assert!(!cfg.matches(&cluster("https://10.0.0.2:6443", "c1")));
        assert!(!cfg.matches(&ClusterInfo::new("https://10.0.0.1:6443", "rotated", "c1")));
    }

    #[test]
    fn test_defaults_deserialize_partial() {
        let defaults: ConnectionDefaults = serde_json::from_str(r#"{"userAgent":"ops/1.0"}"#).unwrap();
        assert_eq!(defaults.user_agent, "ops/1.0");
        assert_eq!(defaults.api_path, "/apis");
        assert_eq!(defaults.read_timeout_secs, 295);
    }
}
