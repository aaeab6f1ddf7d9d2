//! HTTP transport for webhook delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use super::signing::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::core::{OrchestratorError, OrchestratorResult};

/// One POST of a notification. Lives only inside the delivery loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookDeliveryAttempt {
    /// Receiver URL.
    pub url: String,
    /// Serialized notification.
    pub body: String,
    /// Hex HMAC of `body`, when a secret is configured.
    pub signature: Option<String>,
    /// Send time in Unix milliseconds.
    pub timestamp_ms: i64,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
}

/// Sends one delivery attempt.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST the attempt and return the HTTP status.
    ///
    /// `Err` means no response was received (connect failure, timeout).
    async fn post(&self, attempt: &WebhookDeliveryAttempt) -> OrchestratorResult<u16>;
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a transport with a per-request timeout.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidConfig`] if the HTTP client cannot be built.
    pub fn new(request_timeout: Duration) -> OrchestratorResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| OrchestratorError::InvalidConfig(format!("webhook client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, attempt: &WebhookDeliveryAttempt) -> OrchestratorResult<u16> {
        let mut request = self
            .client
            .post(&attempt.url)
            .header(CONTENT_TYPE, "application/json")
            .body(attempt.body.clone());
        if let Some(signature) = &attempt.signature {
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, attempt.timestamp_ms.to_string());
        }
        let response = request
            .send()
            .await
            .map_err(|e| OrchestratorError::Delivery(format!("{}: {e}", attempt.url)))?;
        Ok(response.status().as_u16())
    }
}
