//! Reconciler contract supplied by callers through [`WatchResource`](crate::WatchResource).

use crate::error::ReconcileError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A request to reconcile one object in one cluster context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Request {
    /// Cluster key the object lives in
    pub context: String,
    /// Object namespace (empty for cluster-scoped objects)
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl Request {
    /// Create a request for `namespace/name` in `context`
    pub fn new(context: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.context, self.name)
        } else {
            write!(f, "{}/{}/{}", self.context, self.namespace, self.name)
        }
    }
}

/// Outcome of a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Reconcile again after this delay; `None` waits for the next change
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Wait for the next change event
    pub fn done() -> Self {
        Self::default()
    }

    /// Requeue after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

/// Reconciliation logic for one watched object type.
///
/// The engine hands the reconciler a client for the cluster it is about to
/// watch before the first reconcile. All methods must be `Send` to work with
/// Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    /// Reconcile the object named by `request`.
    async fn reconcile(&self, request: Request) -> Result<ReconcileResult, ReconcileError>;

    /// Inject the client of the cluster being watched.
    fn set_cluster_client(&self, client: kube::Client);
}
