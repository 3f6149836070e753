//! Kubernetes Event recording
//!
//! Events are fire-and-forget: failures are logged and never fail a
//! reconcile. Conditions on the object remain the source of truth.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::crd::ConditionStatus;

/// Controller name reported on Events
pub const REPORTING_CONTROLLER: &str = "aws-privateca-issuer";

/// Publishes Kubernetes Events about issuers and requests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Event type matching a condition status
///
/// False conditions are warnings; everything else is normal.
pub fn event_type_for(status: ConditionStatus) -> EventType {
    match status {
        ConditionStatus::False => EventType::Warning,
        _ => EventType::Normal,
    }
}

/// [`EventPublisher`] backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event actions
pub mod actions {
    /// Issuer verification
    pub const VERIFY: &str = "Verify";
    /// Certificate request processing
    pub const ISSUE: &str = "Issue";
}
