//! Webhook wire payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{InstanceId, OperationId};
use crate::lifecycle::InstanceStatus;

/// Lifecycle phase a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    /// An operation was accepted.
    Initiated,
    /// Intermediate progress (instance created upstream, booting).
    Progress,
    /// Startup finished; the instance is running.
    Completed,
    /// The operation failed; the instance is Failed.
    Failed,
    /// The provider reclaimed a running instance.
    Exited,
    /// A stop finished.
    Stopped,
    /// The instance was deleted.
    Terminated,
}

impl WebhookEvent {
    /// Whether delivery uses the higher retry ceiling.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Exited)
    }
}

/// Phase-specific detail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDetail {
    /// Operation the notification belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    /// Provider id, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_instance_id: Option<String>,
    /// Time from operation start to this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// JSON body POSTed to webhook receivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    /// Internal instance id.
    pub instance_id: InstanceId,
    /// Instance status at the time of the event.
    pub status: InstanceStatus,
    /// Phase.
    pub event: WebhookEvent,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Phase-specific timing and error detail.
    #[serde(default)]
    pub detail: WebhookDetail,
}

impl WebhookNotification {
    /// Notification stamped now.
    #[must_use]
    pub fn new(
        instance_id: Uuid,
        status: InstanceStatus,
        event: WebhookEvent,
        detail: WebhookDetail,
    ) -> Self {
        Self {
            instance_id,
            status,
            event,
            timestamp: Utc::now(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_uses_camel_case() {
        let n = WebhookNotification::new(
            Uuid::nil(),
            InstanceStatus::Running,
            WebhookEvent::Completed,
            WebhookDetail {
                elapsed_ms: Some(1_500),
                ..WebhookDetail::default()
            },
        );
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["instanceId"], Uuid::nil().to_string());
        assert_eq!(json["status"], "running");
        assert_eq!(json["event"], "completed");
        assert_eq!(json["detail"]["elapsedMs"], 1_500);
        assert!(json["detail"].get("error").is_none());
        assert!(json.get("timestamp").is_some());
    }
}
