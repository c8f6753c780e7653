//! Event to reconcile-request mapping.
//!
//! [`EnqueueRequestForController`] turns a changed object into a request for
//! its controller. Same-cluster owner references win over cross-cluster
//! controller references; objects with neither produce nothing.

use crate::reconcile::Request;
use crate::reference::MulticlusterReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&ObjectMeta) -> bool + Send + Sync>;

/// Controller of an object, in resolution priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerOwner {
    /// No controller reference
    None,
    /// Controller owner reference in the object's own cluster
    SameCluster { name: String },
    /// Controller recorded through the multicluster annotation
    CrossCluster(MulticlusterReference),
}

impl ControllerOwner {
    /// Resolve the controller of an object from its metadata.
    pub fn resolve(meta: &ObjectMeta) -> Self {
        let same_cluster = meta
            .owner_references
            .iter()
            .flatten()
            .find(|owner| owner.controller == Some(true));
        if let Some(owner) = same_cluster {
            return Self::SameCluster {
                name: owner.name.clone(),
            };
        }

        match MulticlusterReference::controller_of_meta(meta) {
            Some(reference) => Self::CrossCluster(reference),
            None => Self::None,
        }
    }
}

/// Maps object events to a reconcile request for the object's controller.
#[derive(Clone)]
pub struct EnqueueRequestForController {
    /// Cluster key the watched objects live in
    pub context: String,
    /// Only follow cross-cluster references into this cluster (empty follows all)
    pub controller_context: String,
    predicate: Predicate,
}

impl EnqueueRequestForController {
    /// Mapper accepting every object.
    pub fn new(context: impl Into<String>, controller_context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            controller_context: controller_context.into(),
            predicate: Arc::new(|_| true),
        }
    }

    /// Only map objects for which `predicate` returns true
    #[must_use]
    pub fn with_predicate(mut self, predicate: impl Fn(&ObjectMeta) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Map one object to at most one request.
    pub fn map(&self, meta: &ObjectMeta) -> Option<Request> {
        if !(self.predicate)(meta) {
            return None;
        }

        match ControllerOwner::resolve(meta) {
            ControllerOwner::SameCluster { name } => Some(Request {
                context: self.context.clone(),
                namespace: meta.namespace.clone().unwrap_or_default(),
                name,
            }),
            ControllerOwner::CrossCluster(reference) => {
                if !self.controller_context.is_empty() && reference.cluster_name != self.controller_context {
                    return None;
                }
                Some(Request {
                    context: reference.cluster_name,
                    namespace: reference.namespace,
                    name: reference.name,
                })
            }
            ControllerOwner::None => None,
        }
    }

    /// Object created
    pub fn on_add(&self, meta: &ObjectMeta) -> Option<Request> {
        self.map(meta)
    }

    /// Object updated; the new state decides the request
    pub fn on_update(&self, _old: &ObjectMeta, new: &ObjectMeta) -> Option<Request> {
        self.map(new)
    }

    /// Object deleted
    pub fn on_delete(&self, meta: &ObjectMeta) -> Option<Request> {
        self.map(meta)
    }
}

impl fmt::Debug for EnqueueRequestForController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueRequestForController")
            .field("context", &self.context)
            .field("controller_context", &self.controller_context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn owner(name: &str, controller: Option<bool>) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "ReplicaSet".to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller,
            block_owner_deletion: None,
        }
    }

    fn pod(owners: Vec<OwnerReference>, cross: Option<MulticlusterReference>) -> ObjectMeta {
        let annotations = cross.map(|reference| BTreeMap::from([reference.to_annotation().unwrap()]));
        ObjectMeta {
            name: Some("web-7d9f".to_string()),
            namespace: Some("prod".to_string()),
            owner_references: Some(owners),
            annotations,
            ..Default::default()
        }
    }

    fn hub_ref(cluster: &str) -> MulticlusterReference {
        MulticlusterReference::controller_of("apps/v1", "Deployment", "fleet", "web", cluster)
    }

    #[test]
    fn test_same_cluster_owner_wins() {
        let mapper = EnqueueRequestForController::new("edge-1", "");
        let meta = pod(vec![owner("web-rs", Some(true))], Some(hub_ref("hub")));

        assert_eq!(mapper.map(&meta), Some(Request::new("edge-1", "prod", "web-rs")));
    }

    #[test]
    fn test_non_controller_owner_is_skipped() {
        let mapper = EnqueueRequestForController::new("edge-1", "");
        let meta = pod(vec![owner("gc-only", None), owner("web-rs", Some(true))], None);

        assert_eq!(mapper.map(&meta), Some(Request::new("edge-1", "prod", "web-rs")));
    }

    #[test]
    fn test_cross_cluster_reference() {
        let mapper = EnqueueRequestForController::new("edge-1", "");
        let meta = pod(vec![owner("gc-only", Some(false))], Some(hub_ref("hub")));

        assert_eq!(mapper.map(&meta), Some(Request::new("hub", "fleet", "web")));
    }

    #[test]
    fn test_cross_cluster_reference_filtered_by_controller_context() {
        let meta = pod(vec![], Some(hub_ref("hub")));

        let matching = EnqueueRequestForController::new("edge-1", "hub");
        assert_eq!(matching.map(&meta), Some(Request::new("hub", "fleet", "web")));

        let other = EnqueueRequestForController::new("edge-1", "other-hub");
        assert_eq!(other.map(&meta), None);
    }

    #[test]
    fn test_no_controller_emits_nothing() {
        let mapper = EnqueueRequestForController::new("edge-1", "");
        assert_eq!(mapper.map(&pod(vec![], None)), None);
        assert_eq!(ControllerOwner::resolve(&ObjectMeta::default()), ControllerOwner::None);
    }

    #[test]
    fn test_predicate_rejection_suppresses_everything() {
        let mapper = EnqueueRequestForController::new("edge-1", "").with_predicate(|meta| {
            meta.namespace.as_deref() != Some("prod")
        });
        let meta = pod(vec![owner("web-rs", Some(true))], Some(hub_ref("hub")));

        assert_eq!(mapper.on_add(&meta), None);
        assert_eq!(mapper.on_delete(&meta), None);
    }

    #[test]
    fn test_update_maps_new_object() {
        let mapper = EnqueueRequestForController::new("edge-1", "");
        let old = pod(vec![], None);
        let new = pod(vec![owner("web-rs", Some(true))], None);

        assert_eq!(mapper.on_update(&old, &new), Some(Request::new("edge-1", "prod", "web-rs")));
    }
}
