//! Signed webhook delivery with jittered exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::notification::WebhookNotification;
use super::signing::sign;
use super::transport::{WebhookDeliveryAttempt, WebhookTransport};
use crate::config::WebhookConfig;
use crate::core::{OrchestratorError, OrchestratorResult};
use crate::util::backoff::{exponential_backoff, with_jitter};
use crate::util::clock::now_ms;

/// Outcome of a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Final HTTP status.
    pub status: u16,
}

/// Delivers notifications to client-supplied URLs.
pub struct WebhookDispatcher {
    transport: Arc<dyn WebhookTransport>,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    /// Create a dispatcher over `transport`.
    pub fn new(transport: Arc<dyn WebhookTransport>, config: WebhookConfig) -> Self {
        Self { transport, config }
    }

    /// Delivery policy in effect.
    pub const fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// POST `payload` to `url`, retrying network errors and 5xx up to
    /// `max_retries` times. Signed when `secret` is set.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Delivery`] on a 4xx, or once retries run out.
    pub async fn send_notification(
        &self,
        url: &str,
        payload: &WebhookNotification,
        secret: Option<&str>,
        max_retries: u32,
    ) -> OrchestratorResult<DeliveryReport> {
        let body = serde_json::to_string(payload)?;
        let signature = secret.map(|s| sign(s, body.as_bytes()));
        let max_attempts = max_retries.saturating_add(1);
        let base = Duration::from_millis(self.config.base_delay_ms);
        let cap = Duration::from_millis(self.config.max_delay_ms);

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let request = WebhookDeliveryAttempt {
                url: url.to_string(),
                body: body.clone(),
                signature: signature.clone(),
                timestamp_ms: now_ms(),
                attempt,
                max_attempts,
            };
            match self.transport.post(&request).await {
                Ok(status) if (200..300).contains(&status) => {
                    info!(
                        url,
                        instance_id = %payload.instance_id,
                        event = ?payload.event,
                        attempt,
                        "webhook delivered"
                    );
                    return Ok(DeliveryReport {
                        attempts: attempt,
                        status,
                    });
                }
                Ok(status) if status >= 500 => {
                    last_error = format!("receiver returned {status}");
                }
                Ok(status) => {
                    warn!(url, status, "webhook rejected by receiver, not retrying");
                    return Err(OrchestratorError::Delivery(format!(
                        "{url} rejected notification with {status}"
                    )));
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < max_attempts {
                let delay = with_jitter(
                    exponential_backoff(base, attempt, cap),
                    self.config.jitter_ratio,
                );
                debug!(
                    url,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %last_error,
                    "webhook attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(url, attempts = max_attempts, error = %last_error, "webhook delivery gave up");
        Err(OrchestratorError::Delivery(format!(
            "{url} unreachable after {max_attempts} attempts: {last_error}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::InstanceStatus;
    use crate::webhook::signing::{verify_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use crate::webhook::{HttpTransport, WebhookDetail, WebhookEvent};
    use uuid::Uuid;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher() -> WebhookDispatcher {
        let config = WebhookConfig {
            base_delay_ms: 10,
            max_delay_ms: 50,
            ..WebhookConfig::default()
        };
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        WebhookDispatcher::new(Arc::new(transport), config)
    }

    fn notification() -> WebhookNotification {
        WebhookNotification::new(
            Uuid::new_v4(),
            InstanceStatus::Running,
            WebhookEvent::Completed,
            WebhookDetail::default(),
        )
    }

    #[tokio::test]
    async fn signed_delivery_carries_verifiable_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists(SIGNATURE_HEADER))
            .and(header_exists(TIMESTAMP_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let payload = notification();
        let report = dispatcher()
            .send_notification(&format!("{}/hook", server.uri()), &payload, Some("s3cret"), 3)
            .await
            .unwrap();
        assert_eq!(report.attempts, 1);

        let received = server.received_requests().await.unwrap();
        let sig = received[0].headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert!(verify_signature("s3cret", &received[0].body, sig));
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let report = dispatcher()
            .send_notification(&server.uri(), &notification(), None, 3)
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.status, 204);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .expect(1)
            .mount(&server)
            .await;

        let err = dispatcher()
            .send_notification(&server.uri(), &notification(), None, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Delivery(_)));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = dispatcher()
            .send_notification(&server.uri(), &notification(), None, 2)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
