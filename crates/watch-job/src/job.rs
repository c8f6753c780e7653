//! Watch-job lifecycle orchestrator.
//!
//! [`WatchJob`] owns three concurrent caches keyed by cluster key:
//! - connection configs, derived on first use and reused across restarts
//! - active sessions, whose presence is the only notion of "being watched"
//! - last-known [`ClusterInfo`], used to report stops during bulk teardown
//!
//! Each launch runs the engine in its own task and races the session's first
//! report against a grace period. An error inside the window fails the launch;
//! silence means the session is considered up. Anything a session reports
//! after the window is only logged.

use crate::cluster::ClusterInfo;
use crate::config::{ConnectionConfig, ConnectionDefaults};
use crate::engine::{ClusterWatchEngine, EngineFactory};
use crate::error::{EngineError, WatchJobError};
use crate::hook::{HookHandler, HookKind, HookRegistry};
use crate::keyed_lock::KeyedAsyncLock;
use crate::resource::WatchResource;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Window after launch in which a session failure fails the launch.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Snapshot of one active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Cluster key
    pub key: String,
    /// Unique id of this launch
    pub session_id: Uuid,
    /// When the session was launched
    pub started_at: DateTime<Utc>,
}

struct ActiveSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Starts, verifies, restarts and stops per-cluster watch sessions.
pub struct WatchJob {
    defaults: ConnectionDefaults,
    resources: Arc<[WatchResource]>,
    engines: Arc<dyn EngineFactory>,
    grace_period: Duration,
    hooks: HookRegistry,
    configs: DashMap<String, Arc<ConnectionConfig>>,
    sessions: DashMap<String, ActiveSession>,
    clusters: DashMap<String, ClusterInfo>,
    launch_locks: KeyedAsyncLock,
    root: CancellationToken,
}

impl WatchJob {
    /// Creates a job watching `resources` on every cluster it is given.
    ///
    /// # Errors
    ///
    /// Returns [`WatchJobError::EmptyResourceList`] if `resources` is empty.
    pub fn new(
        defaults: ConnectionDefaults,
        resources: Vec<WatchResource>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<Self, WatchJobError> {
        if resources.is_empty() {
            return Err(WatchJobError::EmptyResourceList);
        }

        Ok(Self {
            defaults,
            resources: resources.into(),
            engines,
            grace_period: DEFAULT_GRACE_PERIOD,
            hooks: HookRegistry::default(),
            configs: DashMap::new(),
            sessions: DashMap::new(),
            clusters: DashMap::new(),
            launch_locks: KeyedAsyncLock::new(),
            root: CancellationToken::new(),
        })
    }

    /// Override the launch grace period.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Appends the callbacks of `handler` to the hook lists.
    pub fn add_hook_handler(&mut self, handler: HookHandler) -> &mut Self {
        self.hooks.register(handler);
        self
    }

    /// Appends several handler sets, in order.
    pub fn add_hook_handlers(&mut self, handlers: impl IntoIterator<Item = HookHandler>) -> &mut Self {
        for handler in handlers {
            self.hooks.register(handler);
        }
        self
    }

    /// Starts watching each cluster that is not already watched.
    ///
    /// Clusters are processed in order. The first failed launch is returned
    /// immediately and the remaining clusters are not attempted.
    ///
    /// # Errors
    ///
    /// - [`WatchJobError::ConfigDerivation`] if a cluster's config cannot be built
    /// - [`WatchJobError::Launch`] if a session fails within the grace period
    /// - [`WatchJobError::ShutDown`] after [`stop_all`](Self::stop_all)
    pub async fn start_watch(&self, clusters: &[ClusterInfo]) -> Result<(), WatchJobError> {
        for cluster in clusters {
            let _guard = self.launch_locks.lock(&cluster.key).await;
            self.ensure_running()?;

            if self.sessions.contains_key(&cluster.key) {
                debug!(cluster = %cluster.key, "Watch already active, skipping");
                continue;
            }
            self.launch(cluster).await?;
        }
        Ok(())
    }

    /// Stops the sessions of the given clusters.
    ///
    /// Clusters without a session are ignored. Waits for an in-flight launch
    /// of the same cluster to finish first.
    pub async fn stop_watch(&self, clusters: &[ClusterInfo]) {
        for cluster in clusters {
            let _guard = self.launch_locks.lock(&cluster.key).await;
            self.stop_session(cluster);
        }
    }

    /// Stops the cluster's session if one exists, then launches a new one.
    ///
    /// When the endpoint or token differ from the cached connection config,
    /// the config is derived again from `cluster`.
    ///
    /// # Errors
    ///
    /// Same as [`start_watch`](Self::start_watch).
    pub async fn restart_watch(&self, cluster: &ClusterInfo) -> Result<(), WatchJobError> {
        let _guard = self.launch_locks.lock(&cluster.key).await;
        self.stop_session(cluster);
        self.ensure_running()?;

        if self.configs.remove_if(&cluster.key, |_, cfg| !cfg.matches(cluster)).is_some() {
            info!(cluster = %cluster.key, "Connection changed, dropping cached config");
        }
        self.launch(cluster).await
    }

    /// Cancels every session and shuts the job down.
    ///
    /// Every session is removed and cancelled before any hook runs, then
    /// "stopped" fires once per removed session. Later start or restart calls
    /// fail with [`WatchJobError::ShutDown`].
    pub fn stop_all(&self) {
        info!(sessions = self.sessions.len(), "Stopping all watch sessions");
        // Cancelling the root first reaches sessions that are still launching.
        self.root.cancel();

        let mut stopped = Vec::new();
        loop {
            let keys: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
            if keys.is_empty() {
                break;
            }
            for key in keys {
                if let Some((key, session)) = self.sessions.remove(&key) {
                    session.cancel.cancel();
                    stopped.push(key);
                }
            }
        }

        for key in stopped {
            let cluster = self.clusters.get(&key).map(|entry| entry.value().clone());
            if let Some(cluster) = cluster {
                self.hooks.fire(HookKind::Stopped, &cluster, None);
            }
        }
    }

    /// Whether a session is cached for `key`.
    pub fn is_watching(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// Keys of all cached sessions, sorted.
    pub fn active_clusters(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Snapshot of all cached sessions, sorted by key.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo {
                key: entry.key().clone(),
                session_id: entry.value().id,
                started_at: entry.value().started_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    /// Cached connection config of `key`.
    pub fn connection_config(&self, key: &str) -> Option<Arc<ConnectionConfig>> {
        self.configs.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether [`stop_all`](Self::stop_all) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// The grace period applied to launches.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    fn ensure_running(&self) -> Result<(), WatchJobError> {
        if self.root.is_cancelled() {
            return Err(WatchJobError::ShutDown);
        }
        Ok(())
    }

    fn stop_session(&self, cluster: &ClusterInfo) {
        let Some((_, session)) = self.sessions.remove(&cluster.key) else {
            return;
        };
        session.cancel.cancel();
        info!(cluster = %cluster.key, session_id = %session.id, "Stopped watch session");
        self.hooks.fire(HookKind::Stopped, cluster, None);
    }

    fn cluster_config(&self, cluster: &ClusterInfo) -> Result<Arc<ConnectionConfig>, WatchJobError> {
        if let Some(cached) = self.configs.get(&cluster.key) {
            debug!(cluster = %cluster.key, "Using cached connection config");
            return Ok(Arc::clone(cached.value()));
        }

        let config = Arc::new(ConnectionConfig::derive(cluster, &self.defaults)?);
        debug!(cluster = %cluster.key, api_base = %config.api_base(), "Derived connection config");
        self.configs.insert(cluster.key.clone(), Arc::clone(&config));
        Ok(config)
    }

    /// Launches one session and classifies it within the grace period.
    ///
    /// The caller holds the cluster's launch lock.
    async fn launch(&self, cluster: &ClusterInfo) -> Result<(), WatchJobError> {
        let config = match self.cluster_config(cluster) {
            Ok(config) => config,
            Err(err) => {
                warn!(cluster = %cluster.key, "Watch launch failed: {}", err);
                self.hooks.fire(HookKind::Failed, cluster, Some(&err));
                return Err(err);
            }
        };

        let session_id = Uuid::new_v4();
        let cancel = self.root.child_token();
        let (done_tx, done_rx) = oneshot::channel();

        let engine = self.engines.create(cluster);
        let span = info_span!("watch_session", cluster = %cluster.key, %session_id);
        tokio::spawn(
            run_session(engine, Arc::clone(&self.resources), config, cancel.clone(), done_tx).instrument(span),
        );

        // Cached before any hook fires, so hooks observe the session.
        self.clusters.insert(cluster.key.clone(), cluster.clone());
        self.sessions.insert(
            cluster.key.clone(),
            ActiveSession {
                id: session_id,
                started_at: Utc::now(),
                cancel,
            },
        );
        // stop_all may have drained the cache between our shutdown check and the insert.
        if self.root.is_cancelled() {
            self.sessions.remove_if(&cluster.key, |_, session| session.id == session_id);
            return Err(WatchJobError::ShutDown);
        }

        info!(cluster = %cluster.key, %session_id, "Launched watch session");
        let raced = tokio::time::timeout(self.grace_period, done_rx).await;

        // stop_all tore the session down while it was racing the grace period.
        let still_cached = self
            .sessions
            .get(&cluster.key)
            .is_some_and(|session| session.id == session_id);
        if self.root.is_cancelled() || !still_cached {
            debug!(cluster = %cluster.key, %session_id, "Session torn down during launch");
            return Err(WatchJobError::ShutDown);
        }

        let outcome = match raced {
            Ok(Ok(Err(source))) => Err(source),
            Ok(Err(_)) => Err(EngineError::Run("watch session exited without reporting".to_string())),
            Ok(Ok(Ok(()))) => {
                debug!(cluster = %cluster.key, "Watch session ended cleanly within the grace period");
                Ok(())
            }
            Err(_) => Ok(()),
        };

        match outcome {
            Ok(()) => {
                info!(cluster = %cluster.key, %session_id, "Watch session is up");
                self.hooks.fire(HookKind::Succeeded, cluster, None);
                Ok(())
            }
            Err(source) => {
                let err = WatchJobError::Launch {
                    key: cluster.key.clone(),
                    source,
                };
                warn!(cluster = %cluster.key, %session_id, "Watch launch failed: {}", err);
                self.hooks.fire(HookKind::Failed, cluster, Some(&err));
                Err(err)
            }
        }
    }
}

impl fmt::Debug for WatchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchJob")
            .field("defaults", &self.defaults)
            .field("resources", &self.resources.len())
            .field("grace_period", &self.grace_period)
            .field("hooks", &self.hooks)
            .field("sessions", &self.active_clusters())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Body of one session task: register every resource, then run the engine.
async fn run_session(
    engine: Box<dyn ClusterWatchEngine>,
    resources: Arc<[WatchResource]>,
    config: Arc<ConnectionConfig>,
    cancel: CancellationToken,
    done: oneshot::Sender<Result<(), EngineError>>,
) {
    let result = drive_engine(engine, &resources, &config, cancel).await;

    // The receiver is gone once the grace period has elapsed.
    if let Err(unreported) = done.send(result) {
        match unreported {
            Ok(()) => info!("Watch session ended"),
            Err(e) => warn!("Watch session failed after the grace period: {}", e),
        }
    }
}

async fn drive_engine(
    mut engine: Box<dyn ClusterWatchEngine>,
    resources: &[WatchResource],
    config: &ConnectionConfig,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    for resource in resources {
        debug!(resource = %resource.display_name(), "Registering watch");
        engine.register_watch(&cancel, config, resource).await?;
    }
    engine.run(cancel).await
}
