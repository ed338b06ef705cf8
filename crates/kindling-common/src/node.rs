//! Node eligibility
//!
//! A node receives image warms iff it has no taints and is not marked
//! unschedulable. The fan-out expansion and the node-change trigger must
//! agree on this judgement, so both call this one predicate.

use k8s_openapi::api::core::v1::Node;

/// True when `node` should receive image warms
pub fn node_eligible(node: &Node) -> bool {
    let Some(spec) = node.spec.as_ref() else {
        return false;
    };
    let tainted = spec.taints.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
    let unschedulable = spec.unschedulable.unwrap_or(false);
    !tainted && !unschedulable
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};

    fn node_with(taints: Option<Vec<Taint>>, unschedulable: Option<bool>) -> Node {
        Node {
            spec: Some(NodeSpec {
                taints,
                unschedulable,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn sample_taint() -> Taint {
        Taint {
            key: "node.kubernetes.io/unreachable".to_string(),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn plain_node_is_eligible() {
        assert!(node_eligible(&node_with(None, None)));
    }

    #[test]
    fn empty_taint_list_is_eligible() {
        assert!(node_eligible(&node_with(Some(vec![]), None)));
    }

    #[test]
    fn tainted_node_is_ineligible() {
        assert!(!node_eligible(&node_with(Some(vec![sample_taint()]), None)));
    }

    #[test]
    fn unschedulable_node_is_ineligible() {
        assert!(!node_eligible(&node_with(None, Some(true))));
    }

    #[test]
    fn unschedulable_false_is_eligible() {
        assert!(node_eligible(&node_with(None, Some(false))));
    }

    #[test]
    fn node_without_spec_is_ineligible() {
        assert!(!node_eligible(&Node::default()));
    }
}
