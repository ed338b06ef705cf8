//! ImageWarm CRD types
//!
//! An `ImageWarm` is the per-node expansion of an [`super::ImageCache`]:
//! one object per eligible node, named `<cache>-on-<node>`. The name
//! derivation is deterministic on purpose — the fan-out controller
//! re-derives identity from (cache, node) without an index, which is what
//! makes create/patch idempotent under replay. External tooling may rely
//! on the naming convention.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::image_cache::ImageCache;
use super::types::{find_condition, set_condition, Condition, ConditionStatus, CONDITION_READY};
use super::LocalSecretReference;
use crate::{LABEL_NODE_NAME, LABEL_OWNER_NAME, LABEL_OWNER_NAMESPACE};

/// ImageWarm asks the warmer daemon on one specific node to pull and keep
/// a container image.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kindling.dev",
    version = "v1alpha1",
    kind = "ImageWarm",
    plural = "imagewarms",
    shortname = "iw",
    namespaced,
    status = "ImageWarmStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageWarmSpec {
    /// Container image reference to pull on the target node
    pub image: String,

    /// Name of the node the warmer daemon should pull on
    pub node_name: String,

    /// Names of Secrets holding registry login information for the image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalSecretReference>,
}

/// Observed state of an ImageWarm, written only by the warmer daemon on
/// the matching node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageWarmStatus {
    /// Conditions representing the pull state on the target node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ImageWarmStatus {
    /// True when the Ready condition exists with status True
    pub fn is_ready(&self) -> bool {
        find_condition(&self.conditions, CONDITION_READY)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Current Ready condition status, if any has been recorded
    pub fn ready_status(&self) -> Option<&ConditionStatus> {
        find_condition(&self.conditions, CONDITION_READY).map(|c| &c.status)
    }

    /// Mark the Ready condition True
    pub fn mark_ready_true(&mut self) {
        set_condition(
            &mut self.conditions,
            Condition::ready(ConditionStatus::True, "ImagePresent", "image present on node"),
        );
    }

    /// Mark the Ready condition Unknown while a pull is in flight
    pub fn mark_pulling(&mut self) {
        set_condition(
            &mut self.conditions,
            Condition::ready(ConditionStatus::Unknown, "Pulling", "image pull submitted"),
        );
    }

    /// Mark the Ready condition False with a reason and message
    pub fn mark_ready_false(&mut self, reason: impl Into<String>, message: impl Into<String>) {
        set_condition(
            &mut self.conditions,
            Condition::ready(ConditionStatus::False, reason, message),
        );
    }
}

impl ImageWarm {
    /// True when the Ready condition is True
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.is_ready()).unwrap_or(false)
    }
}

/// Deterministic ImageWarm name for a cache/node pair: `<cache>-on-<node>`
pub fn warm_name(cache_name: &str, node_name: &str) -> String {
    format!("{}-on-{}", cache_name, node_name)
}

/// Build the desired ImageWarm for `cache` on `node_name`.
///
/// Copies the cache's labels and annotations, injects the node and owner
/// labels used for filtered watches and reverse lookups, and sets a
/// controller owner reference so deletion of the cache cascades.
pub fn build_image_warm(cache: &ImageCache, node_name: &str) -> ImageWarm {
    let cache_name = cache.name_any();
    let namespace = cache.namespace();

    let mut labels: BTreeMap<String, String> = cache.labels().clone();
    labels.insert(LABEL_NODE_NAME.to_string(), node_name.to_string());
    labels.insert(LABEL_OWNER_NAME.to_string(), cache_name.clone());
    labels.insert(
        LABEL_OWNER_NAMESPACE.to_string(),
        namespace.clone().unwrap_or_default(),
    );

    ImageWarm {
        metadata: ObjectMeta {
            name: Some(warm_name(&cache_name, node_name)),
            namespace,
            labels: Some(labels),
            annotations: Some(cache.annotations().clone()),
            owner_references: cache.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: ImageWarmSpec {
            image: cache.spec.image.clone(),
            node_name: node_name.to_string(),
            image_pull_secrets: cache.spec.image_pull_secrets.clone(),
        },
        status: None,
    }
}
