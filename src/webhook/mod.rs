//! Lifecycle notifications delivered to client webhooks.

pub mod dispatcher;
pub mod notification;
pub mod signing;
pub mod transport;

pub use dispatcher::{DeliveryReport, WebhookDispatcher};
pub use notification::{WebhookDetail, WebhookEvent, WebhookNotification};
pub use signing::{sign, verify_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};
pub use transport::{HttpTransport, WebhookDeliveryAttempt, WebhookTransport};
