//! Fleet membership changes.
//!
//! Compares the cluster list on disk with the clusters currently watched and
//! applies the difference to the [`WatchJob`].

use std::collections::HashMap;
use tracing::{info, warn};
use watch_job::{ClusterInfo, WatchJob};

/// Difference between two cluster lists, keyed by cluster key.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FleetDiff {
    /// Keys only present in the new list
    pub added: Vec<ClusterInfo>,
    /// Keys only present in the old list
    pub removed: Vec<ClusterInfo>,
    /// Keys present in both whose endpoint or token changed
    pub changed: Vec<ClusterInfo>,
}

impl FleetDiff {
    /// Diff `current` against `desired`, preserving the order of each list.
    pub fn between(current: &[ClusterInfo], desired: &[ClusterInfo]) -> Self {
        let old: HashMap<&str, &ClusterInfo> = current.iter().map(|c| (c.key.as_str(), c)).collect();
        let new: HashMap<&str, &ClusterInfo> = desired.iter().map(|c| (c.key.as_str(), c)).collect();

        let mut diff = Self::default();
        for cluster in desired {
            match old.get(cluster.key.as_str()) {
                None => diff.added.push(cluster.clone()),
                Some(previous) if previous.connection_differs(cluster) => diff.changed.push(cluster.clone()),
                Some(_) => {}
            }
        }
        diff.removed = current
            .iter()
            .filter(|c| !new.contains_key(c.key.as_str()))
            .cloned()
            .collect();
        diff
    }

    /// Whether the two lists describe the same fleet
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Apply the difference to `job`.
    ///
    /// Launch failures are logged and reported through the job's hooks; the
    /// remaining clusters are still processed.
    pub async fn apply(&self, job: &WatchJob) {
        info!(
            added = self.added.len(),
            removed = self.removed.len(),
            changed = self.changed.len(),
            "Applying fleet changes"
        );

        job.stop_watch(&self.removed).await;
        for cluster in &self.changed {
            if let Err(e) = job.restart_watch(cluster).await {
                warn!(cluster = %cluster.key, "Restart failed: {}", e);
            }
        }
        start_each(job, &self.added).await;
    }
}

/// Start each cluster on its own so one failed launch does not block the rest.
pub async fn start_each(job: &WatchJob, clusters: &[ClusterInfo]) {
    for cluster in clusters {
        if let Err(e) = job.start_watch(std::slice::from_ref(cluster)).await {
            warn!(cluster = %cluster.key, "Start failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use watch_job::mock::{MockBehavior, MockEngineFactory, pod_resource};
    use watch_job::ConnectionDefaults;

    fn cluster(key: &str, token: &str) -> ClusterInfo {
        ClusterInfo::new(format!("https://{key}:6443"), token, key)
    }

    fn job(factory: &MockEngineFactory) -> WatchJob {
        WatchJob::new(ConnectionDefaults::default(), vec![pod_resource()], Arc::new(factory.clone()))
            .unwrap()
            .with_grace_period(Duration::from_millis(50))
    }

    #[test]
    fn test_diff() {
        let current = vec![cluster("a", "t"), cluster("b", "t"), cluster("c", "t")];
        let desired = vec![cluster("b", "rotated"), cluster("c", "t"), cluster("d", "t")];

        let diff = FleetDiff::between(&current, &desired);

        assert_eq!(diff.added, vec![cluster("d", "t")]);
        assert_eq!(diff.removed, vec![cluster("a", "t")]);
        assert_eq!(diff.changed, vec![cluster("b", "rotated")]);
        assert!(FleetDiff::between(&desired, &desired).is_empty());
    }

    #[tokio::test]
    async fn test_apply_diff() {
        let factory = MockEngineFactory::new();
        let job = job(&factory);
        let current = vec![cluster("a", "t"), cluster("b", "t")];
        start_each(&job, &current).await;

        let desired = vec![cluster("b", "rotated"), cluster("c", "t")];
        FleetDiff::between(&current, &desired).apply(&job).await;

        assert_eq!(job.active_clusters(), vec!["b", "c"]);
        assert_eq!(factory.launches("a"), 1);
        assert_eq!(factory.launches("b"), 2);
        assert_eq!(factory.last_config("b").map(|c| c.bearer_token), Some("rotated".to_string()));
    }

    #[tokio::test]
    async fn test_start_each_continues_after_failure() {
        let factory = MockEngineFactory::new();
        factory.set_behavior("a", MockBehavior::FailRegistration("forbidden".to_string()));
        let job = job(&factory);

        start_each(&job, &[cluster("a", "t"), cluster("b", "t")]).await;

        assert_eq!(factory.launches("b"), 1);
        assert!(job.is_watching("b"));
    }
}
