//! Cluster watch engine contract.
//!
//! The orchestrator does not know how a watch is established. It asks an
//! [`EngineFactory`] for a fresh [`ClusterWatchEngine`] per launch, registers
//! every declared resource on it, then drives its run loop until the session's
//! cancellation token fires.

use crate::cluster::ClusterInfo;
use crate::config::ConnectionConfig;
use crate::error::EngineError;
use crate::resource::WatchResource;
use tokio_util::sync::CancellationToken;

/// Establishes and runs the watches of one cluster session.
#[async_trait::async_trait]
pub trait ClusterWatchEngine: Send {
    /// Register a watch for `resource` against the cluster described by `config`.
    ///
    /// Called once per declared resource, in declaration order, before [`run`](Self::run).
    async fn register_watch(
        &mut self,
        cancel: &CancellationToken,
        config: &ConnectionConfig,
        resource: &WatchResource,
    ) -> Result<(), EngineError>;

    /// Run every registered watch until `cancel` fires or a watch fails fatally.
    ///
    /// Returns `Ok(())` on clean cancellation.
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), EngineError>;
}

/// Creates one engine per launch.
pub trait EngineFactory: Send + Sync {
    /// Create an engine for a session against `cluster`
    fn create(&self, cluster: &ClusterInfo) -> Box<dyn ClusterWatchEngine>;
}
