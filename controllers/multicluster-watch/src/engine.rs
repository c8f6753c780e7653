//! kube-runtime backed watch engine.
//!
//! Each session gets its own [`kube::Client`] built from the cluster's
//! connection config. Registration verifies that the API server serves the
//! resource, so a bad token or a missing CRD fails the launch inside the
//! grace period instead of surfacing later as a silent retry loop.
//!
//! Objects in [`MappingMode::Object`] go through [`kube_runtime::Controller`]
//! with debounce and concurrency limits. Objects in [`MappingMode::Controller`]
//! are read from a raw watcher stream and mapped to their controller with
//! [`EnqueueRequestForController`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use http::HeaderValue;
use http::header::USER_AGENT;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject, ListParams};
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, WatchStreamExt, watcher};
use secrecy::SecretString;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use watch_job::{
    ClusterInfo, ClusterWatchEngine, ConnectionConfig, EngineError, EngineFactory, EnqueueRequestForController,
    MappingMode, ReconcileError, ReconcileResult, Reconciler, Request, WatchResource,
};

/// Requeue delay after a failed reconcile.
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

type Watch = BoxFuture<'static, Result<(), EngineError>>;

/// Creates a [`KubeWatchEngine`] per launch.
#[derive(Debug, Default)]
pub struct KubeEngineFactory;

impl EngineFactory for KubeEngineFactory {
    fn create(&self, cluster: &ClusterInfo) -> Box<dyn ClusterWatchEngine> {
        Box::new(KubeWatchEngine::new(cluster.key.clone()))
    }
}

/// Watches of one cluster session.
pub struct KubeWatchEngine {
    context: String,
    client: Option<Client>,
    watches: Vec<Watch>,
}

impl KubeWatchEngine {
    fn new(context: String) -> Self {
        Self {
            context,
            client: None,
            watches: Vec::new(),
        }
    }

    fn client(&mut self, config: &ConnectionConfig) -> Result<Client, EngineError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        debug!(cluster = %self.context, api_base = %config.api_base(), "Building cluster client");
        let client = Client::try_from(client_config(config)?)?;
        self.client = Some(client.clone());
        Ok(client)
    }
}

impl std::fmt::Debug for KubeWatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWatchEngine")
            .field("context", &self.context)
            .field("connected", &self.client.is_some())
            .field("watches", &self.watches.len())
            .finish()
    }
}

#[async_trait]
impl ClusterWatchEngine for KubeWatchEngine {
    async fn register_watch(
        &mut self,
        cancel: &CancellationToken,
        config: &ConnectionConfig,
        resource: &WatchResource,
    ) -> Result<(), EngineError> {
        let name = resource.display_name();
        let client = self.client(config)?;
        let ar = resource.object_type.clone();
        let options = &resource.options;

        let api: Api<DynamicObject> = match &options.namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        };

        let mut list_params = ListParams::default().limit(1);
        let mut watch_config = watcher::Config::default();
        if let Some(labels) = &options.label_selector {
            list_params = list_params.labels(labels);
            watch_config = watch_config.labels(labels);
        }
        if let Some(fields) = &options.field_selector {
            list_params = list_params.fields(fields);
            watch_config = watch_config.fields(fields);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(cluster = %self.context, resource = %name, "Cancelled during registration");
                return Ok(());
            }
            listed = api.list(&list_params) => {
                listed.map_err(|e| EngineError::Registration {
                    resource: name.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        resource.reconciler.set_cluster_client(client);

        let ctx = Arc::new(ReconcileContext {
            cluster: self.context.clone(),
            resource: name,
            reconciler: Arc::clone(&resource.reconciler),
        });

        let watch = match &options.mapping {
            MappingMode::Object => {
                let controller_config = ControllerConfig::default()
                    .debounce(options.debounce)
                    .concurrency(options.concurrency);
                watch_objects(api, watch_config, ar, controller_config, ctx).boxed()
            }
            MappingMode::Controller { controller_context } => {
                let mapper = EnqueueRequestForController::new(self.context.clone(), controller_context.clone());
                watch_controllers(api, watch_config, mapper, ctx, cancel.clone()).boxed()
            }
        };
        self.watches.push(watch);
        Ok(())
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), EngineError> {
        let KubeWatchEngine { context, watches, .. } = *self;
        info!(cluster = %context, watches = watches.len(), "Running watches");

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!(cluster = %context, "Watches cancelled");
                Ok(())
            }
            result = futures::future::try_join_all(watches) => result.map(|_| ()),
        }
    }
}

struct ReconcileContext {
    cluster: String,
    resource: String,
    reconciler: Arc<dyn Reconciler>,
}

/// Convert a derived connection config into a kube client config.
fn client_config(config: &ConnectionConfig) -> Result<kube::Config, EngineError> {
    let mut kube_config = kube::Config::new(config.host.clone());
    kube_config.accept_invalid_certs = config.insecure;
    kube_config.connect_timeout = Some(config.connect_timeout);
    kube_config.read_timeout = Some(config.read_timeout);
    if !config.bearer_token.is_empty() {
        kube_config.auth_info.token = Some(SecretString::from(config.bearer_token.clone()));
    }

    let user_agent = HeaderValue::from_str(&config.user_agent)
        .map_err(|e| EngineError::Config(format!("invalid user agent {:?}: {e}", config.user_agent)))?;
    kube_config.headers.push((USER_AGENT, user_agent));
    Ok(kube_config)
}

fn object_request(cluster: &str, obj: &DynamicObject) -> Request {
    Request::new(cluster, obj.namespace().unwrap_or_default(), obj.name_any())
}

fn object_key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn action_for(result: ReconcileResult) -> Action {
    match result.requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

async fn reconcile_object(obj: Arc<DynamicObject>, ctx: Arc<ReconcileContext>) -> Result<Action, ReconcileError> {
    let request = object_request(&ctx.cluster, &obj);
    debug!("Reconciling {} {}", ctx.resource, request);
    let result = ctx.reconciler.reconcile(request).await?;
    Ok(action_for(result))
}

fn error_policy(obj: Arc<DynamicObject>, error: &ReconcileError, ctx: Arc<ReconcileContext>) -> Action {
    error!(
        "Reconciliation error for {} {}: {}",
        ctx.resource,
        object_request(&ctx.cluster, &obj),
        error
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Reconcile changed objects through a kube-runtime controller.
async fn watch_objects(
    api: Api<DynamicObject>,
    watch_config: watcher::Config,
    ar: kube::api::ApiResource,
    controller_config: ControllerConfig,
    ctx: Arc<ReconcileContext>,
) -> Result<(), EngineError> {
    info!(cluster = %ctx.cluster, "Starting {} watcher", ctx.resource);
    let resource = ctx.resource.clone();

    Controller::new_with(api, watch_config, ar)
        .with_config(controller_config)
        .run(reconcile_object, error_policy, Arc::clone(&ctx))
        .for_each(|res| {
            let resource = resource.clone();
            async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled {} {}", resource, obj),
                    Err(e) => warn!("Controller error for {}: {}", resource, e),
                }
            }
        })
        .await;

    Err(EngineError::Run(format!("controller for {} stopped", ctx.resource)))
}

/// Map changed objects to their controller and reconcile the controller.
///
/// Requests are reconciled one at a time. Requeues are delivered back into
/// the same loop, at most one pending per request, and dropped once the
/// session is cancelled.
async fn watch_controllers(
    api: Api<DynamicObject>,
    watch_config: watcher::Config,
    mapper: EnqueueRequestForController,
    ctx: Arc<ReconcileContext>,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    info!(cluster = %ctx.cluster, "Starting {} controller mapping watcher", ctx.resource);

    let mut events = watcher(api, watch_config).default_backoff().boxed();
    let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<Request>();
    let mut requeues = Requeues::new(requeue_tx, cancel);
    let mut known: HashMap<(String, String), ObjectMeta> = HashMap::new();

    loop {
        let request = tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                match event {
                    Ok(event) => map_event(&mapper, &mut known, event),
                    Err(e) => {
                        warn!("Watch error for {}: {}", ctx.resource, e);
                        None
                    }
                }
            }
            Some(request) = requeue_rx.recv() => {
                requeues.delivered(&request);
                Some(request)
            }
        };

        let Some(request) = request else { continue };
        debug!("Reconciling controller {} for {}", request, ctx.resource);
        let delay = match ctx.reconciler.reconcile(request.clone()).await {
            Ok(result) => result.requeue_after,
            Err(e) => {
                error!("Reconciliation failed for {} {}: {}", ctx.resource, request, e);
                Some(ERROR_REQUEUE)
            }
        };
        if let Some(delay) = delay {
            if !requeues.schedule(request.clone(), delay) {
                debug!("Requeue of {} already pending", request);
            }
        }
    }

    Err(EngineError::Run(format!("watch stream for {} ended", ctx.resource)))
}

fn map_event(
    mapper: &EnqueueRequestForController,
    known: &mut HashMap<(String, String), ObjectMeta>,
    event: watcher::Event<DynamicObject>,
) -> Option<Request> {
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
            match known.insert(object_key(&obj.metadata), obj.metadata.clone()) {
                Some(old) => mapper.on_update(&old, &obj.metadata),
                None => mapper.on_add(&obj.metadata),
            }
        }
        watcher::Event::Delete(obj) => {
            known.remove(&object_key(&obj.metadata));
            mapper.on_delete(&obj.metadata)
        }
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Delayed requeues of one watch loop.
struct Requeues {
    pending: HashSet<Request>,
    tx: mpsc::UnboundedSender<Request>,
    cancel: CancellationToken,
}

impl Requeues {
    fn new(tx: mpsc::UnboundedSender<Request>, cancel: CancellationToken) -> Self {
        Self {
            pending: HashSet::new(),
            tx,
            cancel,
        }
    }

    /// Requeue `request` after `delay` unless a requeue is already pending.
    fn schedule(&mut self, request: Request, delay: Duration) -> bool {
        if !self.pending.insert(request.clone()) {
            return false;
        }
        schedule_requeue(request, delay, self.tx.clone(), self.cancel.clone());
        true
    }

    fn delivered(&mut self, request: &Request) {
        self.pending.remove(request);
    }
}

fn schedule_requeue(request: Request, delay: Duration, tx: mpsc::UnboundedSender<Request>, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(delay) => {
                // Receiver is gone once the watch loop has returned.
                let _ = tx.send(request);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use secrecy::ExposeSecret;
    use watch_job::ConnectionDefaults;

    fn derived(token: &str) -> ConnectionConfig {
        let cluster = ClusterInfo::new("https://10.0.0.12:6443", token, "edge-1");
        ConnectionConfig::derive(&cluster, &ConnectionDefaults::default()).unwrap()
    }

    fn meta(name: &str, owner: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("prod".to_string()),
            owner_references: owner.map(|owner| {
                vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "ReplicaSet".to_string(),
                    name: owner.to_string(),
                    uid: format!("uid-{owner}"),
                    controller: Some(true),
                    block_owner_deletion: None,
                }]
            }),
            ..Default::default()
        }
    }

    fn pod(meta: ObjectMeta) -> DynamicObject {
        let ar = kube::api::ApiResource::erase::<k8s_openapi::api::core::v1::Pod>(&());
        let mut obj = DynamicObject::new(meta.name.as_deref().unwrap_or_default(), &ar);
        obj.metadata = meta;
        obj
    }

    #[test]
    fn test_client_config_carries_connection_settings() {
        let config = derived("s3cret");
        let kube_config = client_config(&config).unwrap();

        assert_eq!(kube_config.cluster_url, config.host);
        assert!(kube_config.accept_invalid_certs);
        assert_eq!(kube_config.connect_timeout, Some(Duration::from_secs(30)));
        assert_eq!(kube_config.read_timeout, Some(Duration::from_secs(295)));
        assert_eq!(
            kube_config.auth_info.token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("s3cret".to_string())
        );
        assert!(
            kube_config
                .headers
                .iter()
                .any(|(name, value)| *name == USER_AGENT && value.to_str().ok() == Some(config.user_agent.as_str()))
        );
    }

    #[test]
    fn test_client_config_without_token() {
        let kube_config = client_config(&derived("")).unwrap();
        assert!(kube_config.auth_info.token.is_none());
    }

    #[test]
    fn test_client_config_rejects_bad_user_agent() {
        let mut config = derived("t");
        config.user_agent = "bad\nagent".to_string();
        assert!(matches!(client_config(&config), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_action_for_result() {
        assert_eq!(action_for(ReconcileResult::done()), Action::await_change());
        assert_eq!(
            action_for(ReconcileResult::requeue(Duration::from_secs(5))),
            Action::requeue(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_object_request() {
        let obj = pod(meta("web-1", None));
        assert_eq!(object_request("edge-1", &obj), Request::new("edge-1", "prod", "web-1"));
    }

    #[test]
    fn test_map_event_tracks_add_update_delete() {
        let mapper = EnqueueRequestForController::new("edge-1", "");
        let mut known = HashMap::new();

        let added = map_event(&mapper, &mut known, watcher::Event::Apply(pod(meta("web-1", Some("web-rs")))));
        assert_eq!(added, Some(Request::new("edge-1", "prod", "web-rs")));
        assert_eq!(known.len(), 1);

        // Owner removed: the new state decides.
        let updated = map_event(&mapper, &mut known, watcher::Event::Apply(pod(meta("web-1", None))));
        assert_eq!(updated, None);
        assert_eq!(known.len(), 1);

        let deleted = map_event(&mapper, &mut known, watcher::Event::Delete(pod(meta("web-1", Some("web-rs")))));
        assert_eq!(deleted, Some(Request::new("edge-1", "prod", "web-rs")));
        assert!(known.is_empty());

        assert_eq!(map_event(&mapper, &mut known, watcher::Event::InitDone), None);
    }

    #[tokio::test]
    async fn test_one_pending_requeue_per_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut requeues = Requeues::new(tx, CancellationToken::new());
        let request = Request::new("c1", "ns", "a");

        assert!(requeues.schedule(request.clone(), Duration::from_millis(10)));
        assert!(!requeues.schedule(request.clone(), Duration::from_millis(10)));
        assert!(requeues.schedule(Request::new("c1", "ns", "b"), Duration::from_millis(10)));
        assert_eq!(requeues.pending.len(), 2);

        let mut delivered = Vec::new();
        for _ in 0..2 {
            let due = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            requeues.delivered(&due);
            delivered.push(due);
        }
        delivered.sort();
        assert_eq!(delivered, vec![request.clone(), Request::new("c1", "ns", "b")]);
        assert!(requeues.pending.is_empty());
        assert!(requeues.schedule(request, Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_requeue_dropped_after_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        schedule_requeue(Request::new("c1", "ns", "a"), Duration::from_secs(30), tx.clone(), cancel.clone());
        schedule_requeue(Request::new("c1", "ns", "b"), Duration::from_millis(10), tx, CancellationToken::new());
        cancel.cancel();

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(delivered, Some(Request::new("c1", "ns", "b")));
        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    }
}
