//! Declared watch resources.

use crate::reconcile::Reconciler;
use kube::api::ApiResource;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How change events of a watched object become reconcile requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MappingMode {
    /// Reconcile the changed object itself
    #[default]
    Object,
    /// Reconcile the object's controller, same-cluster owner first, then the
    /// cross-cluster controller reference. A non-empty `controller_context`
    /// drops cross-cluster references pointing at any other cluster.
    Controller { controller_context: String },
}

/// Watch options applied when registering a resource against a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Namespace to watch (`None` watches all namespaces)
    pub namespace: Option<String>,
    /// Label selector
    pub label_selector: Option<String>,
    /// Field selector
    pub field_selector: Option<String>,
    /// Event to request mapping
    pub mapping: MappingMode,
    /// Maximum concurrent reconciles for this resource
    pub concurrency: u16,
    /// Wait this long after the last event before reconciling
    pub debounce: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            field_selector: None,
            mapping: MappingMode::Object,
            concurrency: 3,
            debounce: Duration::from_secs(1),
        }
    }
}

/// One object type to watch plus its reconciliation logic.
///
/// The list handed to [`WatchJob::new`](crate::WatchJob::new) is shared
/// read-only by every cluster session.
#[derive(Clone)]
pub struct WatchResource {
    /// Object type descriptor (group, version, kind, plural)
    pub object_type: ApiResource,
    /// Reconciler invoked for requests of this resource
    pub reconciler: Arc<dyn Reconciler>,
    /// Watch options
    pub options: WatchOptions,
}

impl WatchResource {
    /// Watch objects of type `K` with default options.
    pub fn of<K>(reconciler: Arc<dyn Reconciler>) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Self::new(ApiResource::erase::<K>(&()), reconciler)
    }

    /// Watch objects described by `object_type` with default options.
    pub fn new(object_type: ApiResource, reconciler: Arc<dyn Reconciler>) -> Self {
        Self {
            object_type,
            reconciler,
            options: WatchOptions::default(),
        }
    }

    /// Replace the watch options
    #[must_use]
    pub fn with_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Human-readable resource name for logs and errors (e.g. "apps/v1/Deployment").
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.object_type.api_version, self.object_type.kind)
    }
}

impl fmt::Debug for WatchResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchResource")
            .field("object_type", &self.object_type)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
