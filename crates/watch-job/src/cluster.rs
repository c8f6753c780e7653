//! Remote cluster identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one remote cluster: where its API server lives, the bearer
/// token used to reach it, and the stable key every cache is indexed by.
///
/// Two values with the same `key` are the same cluster even when endpoint or
/// token differ. A newer value only replaces an older one through
/// [`WatchJob::restart_watch`](crate::WatchJob::restart_watch).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    /// API server URL (e.g. "https://10.0.0.12:6443")
    pub endpoint: String,

    /// Bearer token
    #[serde(default)]
    pub token: String,

    /// Unique cluster key
    pub key: String,
}

impl ClusterInfo {
    /// Create cluster info from endpoint, token and key
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            key: key.into(),
        }
    }

    /// Whether `other` points at a different endpoint or carries a different token.
    pub fn connection_differs(&self, other: &ClusterInfo) -> bool {
        self.endpoint != other.endpoint || self.token != other.token
    }
}

// Tokens must not end up in logs.
impl fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterInfo")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_token() {
        let info = ClusterInfo::new("https://10.0.0.1:6443", "s3cr3t", "edge-1");
        let rendered = format!("{info:?}");
        assert!(rendered.contains("edge-1"));
        assert!(!rendered.contains("s3cr3t"), "token leaked: {rendered}");
    }

    #[test]
    fn test_connection_differs() {
        let a = ClusterInfo::new("https://a:6443", "t1", "c1");
        assert!(!a.connection_differs(&a.clone()));
        assert!(a.connection_differs(&ClusterInfo::new("https://b:6443", "t1", "c1")));
        assert!(a.connection_differs(&ClusterInfo::new("https://a:6443", "t2", "c1")));
    }

    #[test]
    fn test_deserialize_cluster_list() {
        let yaml = r#"
- endpoint: https://10.0.0.1:6443
  token: abc
  key: edge-1
- endpoint: https://10.0.0.2:6443
  key: edge-2
"#;
        let clusters: Vec<ClusterInfo> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].token, "abc");
        assert_eq!(clusters[1].key, "edge-2");
        assert!(clusters[1].token.is_empty());
    }
}
