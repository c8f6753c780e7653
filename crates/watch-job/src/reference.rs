//! Cross-cluster controller references
//!
//! Kubernetes owner references cannot point across clusters, so a controller
//! living in another cluster records itself on the controlled object as a JSON
//! annotation. These references follow the `OwnerReference` shape with an
//! extra `clusterName` and an explicit `namespace`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation holding the JSON-encoded [`MulticlusterReference`] of an
/// object's cross-cluster controller.
pub const MULTICLUSTER_CONTROLLER_ANNOTATION: &str = "multicluster.io/controller-reference";

/// Reference from an object to its controller in another cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MulticlusterReference {
    /// API version of the controller (e.g. "apps/v1")
    pub api_version: String,

    /// Kind of the controller (e.g. "Deployment")
    pub kind: String,

    /// Name of the controller
    pub name: String,

    /// Namespace of the controller
    #[serde(default)]
    pub namespace: String,

    /// Cluster key the controller lives in
    pub cluster_name: String,

    /// UID of the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Whether this reference points at the managing controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

impl MulticlusterReference {
    /// Create a controller reference to `namespace/name` in `cluster_name`
    pub fn controller_of(
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        cluster_name: &str,
    ) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            cluster_name: cluster_name.to_string(),
            uid: None,
            controller: Some(true),
        }
    }

    /// Read the cross-cluster controller reference of an object, if any.
    ///
    /// A malformed annotation or a reference explicitly marked
    /// `controller: false` yields `None`.
    pub fn controller_of_meta(meta: &ObjectMeta) -> Option<Self> {
        let raw = meta.annotations.as_ref()?.get(MULTICLUSTER_CONTROLLER_ANNOTATION)?;
        let reference: Self = serde_json::from_str(raw).ok()?;
        if reference.controller == Some(false) || reference.name.is_empty() {
            return None;
        }
        Some(reference)
    }

    /// Annotation entry recording this reference on a controlled object.
    pub fn to_annotation(&self) -> Result<(String, String), serde_json::Error> {
        Ok((MULTICLUSTER_CONTROLLER_ANNOTATION.to_string(), serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn meta_with(annotation: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some("pod-a".to_string()),
            annotations: Some(BTreeMap::from([(
                MULTICLUSTER_CONTROLLER_ANNOTATION.to_string(),
                annotation.to_string(),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn test_reads_annotation() {
        let reference = MulticlusterReference::controller_of("apps/v1", "Deployment", "prod", "web", "hub");
        let (_, value) = reference.to_annotation().unwrap();

        assert_eq!(MulticlusterReference::controller_of_meta(&meta_with(&value)), Some(reference));
    }

    #[test]
    fn test_ignores_malformed_annotation() {
        assert_eq!(MulticlusterReference::controller_of_meta(&meta_with("{not json")), None);
    }

    #[test]
    fn test_ignores_non_controller_reference() {
        let raw = r#"{"apiVersion":"v1","kind":"Service","name":"svc","clusterName":"hub","controller":false}"#;
        assert_eq!(MulticlusterReference::controller_of_meta(&meta_with(raw)), None);
    }

    #[test]
    fn test_missing_annotation() {
        assert_eq!(MulticlusterReference::controller_of_meta(&ObjectMeta::default()), None);
    }
}
