//! Mock watch engine for unit testing
//!
//! [`MockEngineFactory`] hands out engines whose behavior is scripted per
//! cluster key, and records every launch, registration and cancellation so
//! tests can assert on what the orchestrator did without a real cluster.

use crate::cluster::ClusterInfo;
use crate::config::ConnectionConfig;
use crate::engine::{ClusterWatchEngine, EngineFactory};
use crate::error::{EngineError, ReconcileError};
use crate::reconcile::{ReconcileResult, Reconciler, Request};
use crate::resource::WatchResource;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scripted behavior of a mock engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MockBehavior {
    /// Register everything, then block until cancelled
    #[default]
    RunUntilCancelled,
    /// Fail registering the first resource
    FailRegistration(String),
    /// Register everything, then fail the run loop after `after`
    FailRun { after: Duration, reason: String },
    /// Register everything, then return from the run loop immediately
    ExitCleanly,
    /// Register everything, then panic in the run loop
    Panic,
}

#[derive(Debug, Default)]
struct Recorder {
    default_behavior: Mutex<MockBehavior>,
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    launches: Mutex<HashMap<String, usize>>,
    registrations: Mutex<Vec<(String, String)>>,
    configs: Mutex<HashMap<String, ConnectionConfig>>,
    running: AtomicUsize,
    cancelled: AtomicUsize,
}

/// Mock [`EngineFactory`] for testing
#[derive(Debug, Clone, Default)]
pub struct MockEngineFactory {
    recorder: Arc<Recorder>,
}

impl MockEngineFactory {
    /// Factory whose engines run until cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose engines follow `behavior` unless overridden per cluster
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let factory = Self::default();
        *lock(&factory.recorder.default_behavior) = behavior;
        factory
    }

    /// Script the behavior of the next engines created for `key`
    pub fn set_behavior(&self, key: &str, behavior: MockBehavior) {
        lock(&self.recorder.behaviors).insert(key.to_string(), behavior);
    }

    /// Number of engines created for `key`
    pub fn launches(&self, key: &str) -> usize {
        lock(&self.recorder.launches).get(key).copied().unwrap_or(0)
    }

    /// Number of engines created for all clusters
    pub fn total_launches(&self) -> usize {
        lock(&self.recorder.launches).values().sum()
    }

    /// `(cluster key, resource name)` of every registration, in call order
    pub fn registrations(&self) -> Vec<(String, String)> {
        lock(&self.recorder.registrations).clone()
    }

    /// Connection config last used to register a watch on `key`
    pub fn last_config(&self, key: &str) -> Option<ConnectionConfig> {
        lock(&self.recorder.configs).get(key).cloned()
    }

    /// Engines currently blocked in their run loop
    pub fn running_sessions(&self) -> usize {
        self.recorder.running.load(Ordering::SeqCst)
    }

    /// Engines whose run loop returned because of cancellation
    pub fn cancelled_sessions(&self) -> usize {
        self.recorder.cancelled.load(Ordering::SeqCst)
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(&self, cluster: &ClusterInfo) -> Box<dyn ClusterWatchEngine> {
        *lock(&self.recorder.launches).entry(cluster.key.clone()).or_insert(0) += 1;
        let behavior = lock(&self.recorder.behaviors)
            .get(&cluster.key)
            .cloned()
            .unwrap_or_else(|| lock(&self.recorder.default_behavior).clone());

        Box::new(MockEngine {
            key: cluster.key.clone(),
            behavior,
            recorder: Arc::clone(&self.recorder),
        })
    }
}

struct MockEngine {
    key: String,
    behavior: MockBehavior,
    recorder: Arc<Recorder>,
}

#[async_trait::async_trait]
impl ClusterWatchEngine for MockEngine {
    async fn register_watch(
        &mut self,
        _cancel: &CancellationToken,
        config: &ConnectionConfig,
        resource: &WatchResource,
    ) -> Result<(), EngineError> {
        let name = resource.display_name();
        lock(&self.recorder.registrations).push((self.key.clone(), name.clone()));
        lock(&self.recorder.configs).insert(self.key.clone(), config.clone());

        if let MockBehavior::FailRegistration(reason) = &self.behavior {
            return Err(EngineError::Registration {
                resource: name,
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), EngineError> {
        let MockEngine { behavior, recorder, .. } = *self;
        match behavior {
            MockBehavior::RunUntilCancelled => {
                recorder.running.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
                recorder.running.fetch_sub(1, Ordering::SeqCst);
                recorder.cancelled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            MockBehavior::FailRun { after, reason } => {
                tokio::select! {
                    () = tokio::time::sleep(after) => Err(EngineError::Run(reason)),
                    () = cancel.cancelled() => {
                        recorder.cancelled.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            }
            MockBehavior::ExitCleanly => Ok(()),
            MockBehavior::Panic => panic!("mock engine panicked"),
            // Registration already failed; never reached
            MockBehavior::FailRegistration(reason) => Err(EngineError::Run(reason)),
        }
    }
}

/// Reconciler that counts calls and accepts every request
#[derive(Debug, Default)]
pub struct NoopReconciler {
    reconciles: AtomicUsize,
    clients: AtomicUsize,
}

impl NoopReconciler {
    /// Number of reconcile calls
    pub fn reconciles(&self) -> usize {
        self.reconciles.load(Ordering::SeqCst)
    }

    /// Number of injected cluster clients
    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Reconciler for NoopReconciler {
    async fn reconcile(&self, _request: Request) -> Result<ReconcileResult, ReconcileError> {
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        Ok(ReconcileResult::done())
    }

    fn set_cluster_client(&self, _client: kube::Client) {
        self.clients.fetch_add(1, Ordering::SeqCst);
    }
}

/// A Pod watch resource backed by a [`NoopReconciler`]
pub fn pod_resource() -> WatchResource {
    WatchResource::of::<k8s_openapi::api::core::v1::Pod>(Arc::new(NoopReconciler::default()))
}

/// A ConfigMap watch resource backed by a [`NoopReconciler`]
pub fn config_map_resource() -> WatchResource {
    WatchResource::of::<k8s_openapi::api::core::v1::ConfigMap>(Arc::new(NoopReconciler::default()))
}

// Lock poisoning only happens if a test already panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
