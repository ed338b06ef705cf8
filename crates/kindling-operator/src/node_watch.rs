//! Node-change trigger for the fan-out controller
//!
//! Kubernetes watch events deliver only the new object, but the fan-out
//! only cares about *eligibility flips* — an update that leaves eligibility
//! unchanged on both sides must not re-enqueue anything. The tracker keeps
//! each node's last observed eligibility so the mapper can tell a flip from
//! a no-op update.

use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::debug;

use kindling_common::crd::ImageCache;
use kindling_common::node::node_eligible;

/// Remembers the last observed eligibility per node name
#[derive(Default)]
pub struct NodeEligibilityTracker {
    seen: DashMap<String, bool>,
}

impl NodeEligibilityTracker {
    /// Record a node observation.
    ///
    /// Returns true when the observation should re-enqueue every ImageCache:
    /// a node appearing eligible, an eligibility flip in either direction,
    /// or an eligible node going away.
    pub fn observe(&self, name: &str, eligible: bool, deleting: bool) -> bool {
        if deleting {
            self.seen.remove(name);
            return eligible;
        }
        match self.seen.insert(name.to_string(), eligible) {
            None => eligible,
            Some(previous) => previous != eligible,
        }
    }
}

/// Build the `.watches(Node)` mapper: on a relevant node change, re-enqueue
/// every ImageCache currently in the controller's store.
pub fn node_trigger(
    store: Store<ImageCache>,
    tracker: Arc<NodeEligibilityTracker>,
) -> impl Fn(Node) -> Vec<ObjectRef<ImageCache>> {
    move |node: Node| {
        let name = node.name_any();
        let eligible = node_eligible(&node);
        let deleting = node.metadata.deletion_timestamp.is_some();

        if !tracker.observe(&name, eligible, deleting) {
            return Vec::new();
        }

        let caches: Vec<_> = store
            .state()
            .iter()
            .map(|cache| ObjectRef::from_obj(cache.as_ref()))
            .collect();
        debug!(
            node = %name,
            eligible,
            caches = caches.len(),
            "node eligibility changed, re-enqueueing image caches"
        );
        caches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_eligible_node_triggers() {
        let tracker = NodeEligibilityTracker::default();
        assert!(tracker.observe("node-a", true, false));
    }

    #[test]
    fn new_ineligible_node_does_not_trigger() {
        let tracker = NodeEligibilityTracker::default();
        assert!(!tracker.observe("node-a", false, false));
    }

    #[test]
    fn unchanged_eligibility_does_not_trigger() {
        let tracker = NodeEligibilityTracker::default();
        tracker.observe("node-a", true, false);
        assert!(!tracker.observe("node-a", true, false));
        assert!(!tracker.observe("node-a", true, false));
    }

    #[test]
    fn flip_triggers_in_both_directions() {
        let tracker = NodeEligibilityTracker::default();
        tracker.observe("node-a", true, false);
        assert!(tracker.observe("node-a", false, false));
        assert!(tracker.observe("node-a", true, false));
    }

    #[test]
    fn deleting_eligible_node_triggers_and_forgets() {
        let tracker = NodeEligibilityTracker::default();
        tracker.observe("node-a", true, false);
        assert!(tracker.observe("node-a", true, true));
        // Re-added later: treated as a fresh node again
        assert!(tracker.observe("node-a", true, false));
    }

    #[test]
    fn deleting_ineligible_node_does_not_trigger() {
        let tracker = NodeEligibilityTracker::default();
        tracker.observe("node-a", false, false);
        assert!(!tracker.observe("node-a", false, true));
    }
}
