//! Supporting types shared by the Kindling CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The "Ready" condition type used on both ImageCache and ImageWarm
pub const CONDITION_READY: &str = "Ready";

/// Reference to a Secret in the same namespace as the referencing object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalSecretReference {
    /// Name of the referenced Secret
    pub name: String,
}

impl LocalSecretReference {
    /// Create a reference to the named secret
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Ready condition with the given status, reason, and message
    pub fn ready(
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(CONDITION_READY, status, reason, message)
    }
}

/// Replace the condition of the same type in `conditions`, preserving the
/// previous transition timestamp when the status did not actually change.
pub(crate) fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    let mut condition = condition;
    if let Some(prev) = conditions.iter().find(|c| c.type_ == condition.type_) {
        if prev.status == condition.status {
            condition.last_transition_time = prev.last_transition_time;
        }
    }
    conditions.retain(|c| c.type_ != condition.type_);
    conditions.push(condition);
}

/// Look up the condition of the given type
pub(crate) fn find_condition<'a>(
    conditions: &'a [Condition],
    type_: &str,
) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_replaces_by_type() {
        let mut conditions = vec![Condition::ready(
            ConditionStatus::Unknown,
            "Pulling",
            "pull in progress",
        )];
        set_condition(
            &mut conditions,
            Condition::ready(ConditionStatus::True, "ImagePresent", "image exists"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(conditions[0].reason, "ImagePresent");
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_unchanged() {
        let first = Condition::ready(ConditionStatus::True, "ImagePresent", "image exists");
        let stamp = first.last_transition_time;
        let mut conditions = vec![first];

        set_condition(
            &mut conditions,
            Condition::ready(ConditionStatus::True, "ImagePresent", "still there"),
        );
        assert_eq!(conditions[0].last_transition_time, stamp);
        assert_eq!(conditions[0].message, "still there");
    }

    #[test]
    fn condition_status_display() {
        assert_eq!(ConditionStatus::True.to_string(), "True");
        assert_eq!(ConditionStatus::False.to_string(), "False");
        assert_eq!(ConditionStatus::Unknown.to_string(), "Unknown");
    }
}
