//! Reconciliation logic of the controller.
//!
//! The shipped reconciler records every request it receives. It is the
//! extension point for real per-object logic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::info;
use watch_job::{ReconcileError, ReconcileResult, Reconciler, Request};

/// Logs every reconcile request.
///
/// One instance serves every watched cluster, so requests are told apart by
/// [`Request::context`], not by the injected client.
#[derive(Debug)]
pub struct LoggingReconciler {
    kind: String,
    clients: AtomicUsize,
    last: Mutex<Option<Request>>,
}

impl LoggingReconciler {
    /// Creates a reconciler for objects of `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            clients: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    /// Number of cluster clients injected so far.
    #[cfg(test)]
    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// The most recent request.
    #[cfg(test)]
    pub fn last_request(&self) -> Option<Request> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

#[async_trait::async_trait]
impl Reconciler for LoggingReconciler {
    async fn reconcile(&self, request: Request) -> Result<ReconcileResult, ReconcileError> {
        info!(kind = %self.kind, cluster = %request.context, "Reconciling {}", request);
        let mut last = self
            .last
            .lock()
            .map_err(|e| ReconcileError::new(format!("request log lock poisoned: {e}")))?;
        *last = Some(request);
        Ok(ReconcileResult::done())
    }

    fn set_cluster_client(&self, _client: kube::Client) {
        let count = self.clients.fetch_add(1, Ordering::SeqCst) + 1;
        info!(kind = %self.kind, clients = count, "Cluster client injected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reconcile_records_request() {
        let reconciler = LoggingReconciler::new("Pod");
        let request = Request::new("edge-1", "prod", "web-1");

        let result = reconciler.reconcile(request.clone()).await.unwrap();

        assert_eq!(result, ReconcileResult::done());
        assert_eq!(reconciler.last_request(), Some(request));
        assert_eq!(reconciler.clients(), 0);
    }
}
