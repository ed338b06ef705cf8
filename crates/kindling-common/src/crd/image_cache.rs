//! ImageCache CRD types
//!
//! An `ImageCache` names one container image (and optional pull secrets)
//! that should be pre-pulled onto every eligible node. The fan-out
//! controller expands it into per-node `ImageWarm` objects and rolls their
//! readiness back up into the cache's `Ready` condition.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, set_condition, Condition, ConditionStatus, CONDITION_READY};
use super::LocalSecretReference;

/// ImageCache expresses a desire to have a container image cached on
/// every eligible node in the cluster.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kindling.dev",
    version = "v1alpha1",
    kind = "ImageCache",
    plural = "imagecaches",
    shortname = "ic",
    namespaced,
    status = "ImageCacheStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageCacheSpec {
    /// Container image reference to cache across the cluster
    pub image: String,

    /// Names of Secrets holding registry login information for the image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalSecretReference>,
}

/// Observed state of an ImageCache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageCacheStatus {
    /// Conditions representing the aggregate warm state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation most recently acted on by the fan-out controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ImageCacheStatus {
    /// True when the Ready condition exists with status True
    pub fn is_ready(&self) -> bool {
        find_condition(&self.conditions, CONDITION_READY)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Mark the Ready condition True
    pub fn mark_ready_true(&mut self) {
        set_condition(
            &mut self.conditions,
            Condition::ready(ConditionStatus::True, "WarmsReady", "all image warms ready"),
        );
    }

    /// Mark the Ready condition False with a reason and message
    pub fn mark_ready_false(&mut self, reason: impl Into<String>, message: impl Into<String>) {
        set_condition(
            &mut self.conditions,
            Condition::ready(ConditionStatus::False, reason, message),
        );
    }

    /// Mark the Ready condition Unknown with a reason and message
    pub fn mark_ready_unknown(&mut self, reason: impl Into<String>, message: impl Into<String>) {
        set_condition(
            &mut self.conditions,
            Condition::ready(ConditionStatus::Unknown, reason, message),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_starts_not_ready() {
        let status = ImageCacheStatus::default();
        assert!(!status.is_ready());
    }

    #[test]
    fn mark_ready_true_then_false_round_trip() {
        let mut status = ImageCacheStatus::default();
        status.mark_ready_true();
        assert!(status.is_ready());

        status.mark_ready_false("ResourceNotReady", "warm app-on-node1 not ready");
        assert!(!status.is_ready());
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].reason, "ResourceNotReady");
    }

    #[test]
    fn spec_defaults_to_no_pull_secrets() {
        let spec: ImageCacheSpec =
            serde_json::from_value(serde_json::json!({"image": "redis:7"})).unwrap();
        assert_eq!(spec.image, "redis:7");
        assert!(spec.image_pull_secrets.is_empty());
    }
}
