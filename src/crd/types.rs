//! Condition types shared by the issuer CRDs and CertificateRequest status

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting overall readiness
pub const CONDITION_READY: &str = "Ready";

/// Condition type tracking an in-flight issuance attempt
pub const CONDITION_ISSUING: &str = "Issuing";

/// Condition type set by an approver when a request is approved
pub const CONDITION_APPROVED: &str = "Approved";

/// Condition type set by an approver when a request is denied
pub const CONDITION_DENIED: &str = "Denied";

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
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
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready, Issuing)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
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
            last_transition_time: Some(Utc::now()),
            observed_generation: None,
        }
    }
}

/// Find the condition of the given type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or replace a condition of the same type
///
/// The previous transition time is kept when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status && existing.last_transition_time.is_some() {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
        return;
    }
    conditions.push(condition);
}
