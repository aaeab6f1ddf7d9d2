//! Provider, resilience and webhook configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upstream provider REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the instance API.
    pub base_url: String,
    /// Bearer token.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.novita.ai/gpu-instance/openapi/v1".into(),
            api_key: None,
            request_timeout_secs: 30,
        }
    }
}

impl ProviderConfig {
    /// Validate provider configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(format!("base_url `{}` is not an http(s) URL", self.base_url));
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".into());
        }
        Ok(())
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed.
    pub cooldown_ms: u64,
    /// Successful probes needed to close from half-open.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Cooldown as a duration.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Sliding-window rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Requests allowed per window.
    pub max_requests: usize,
    /// Window length.
    pub window_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 100_000,
        }
    }
}

impl RateLimiterConfig {
    /// Window as a duration.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Settings for the gate wrapped around every provider call.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rate limit.
    pub rate_limiter: RateLimiterConfig,
    /// Timeout applied to each guarded call; `None` relies on the client's own.
    pub call_timeout_ms: Option<u64>,
}

impl ResilienceConfig {
    /// Validate resilience configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err("circuit_breaker.failure_threshold must be greater than 0".into());
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err("circuit_breaker.success_threshold must be greater than 0".into());
        }
        if self.rate_limiter.max_requests == 0 || self.rate_limiter.window_ms == 0 {
            return Err("rate_limiter limits must be greater than 0".into());
        }
        if self.call_timeout_ms == Some(0) {
            return Err("call_timeout_ms must be greater than 0".into());
        }
        Ok(())
    }
}

/// Webhook delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Receiver used when an instance has no URL of its own.
    pub default_url: Option<String>,
    /// HMAC secret; unsigned delivery when absent.
    pub secret: Option<String>,
    /// Retry ceiling for startup completion and failure notifications.
    pub critical_max_retries: u32,
    /// Retry ceiling for best-effort notifications.
    pub default_max_retries: u32,
    /// Backoff base.
    pub base_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
    /// Upper bound of random jitter as a fraction of the delay.
    pub jitter_ratio: f64,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            default_url: None,
            secret: None,
            critical_max_retries: 5,
            default_max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.1,
            request_timeout_ms: 10_000,
        }
    }
}

impl WebhookConfig {
    /// Validate webhook configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err("jitter_ratio must be within 0.0..=1.0".into());
        }
        if self.base_delay_ms == 0 || self.request_timeout_ms == 0 {
            return Err("webhook delays and timeouts must be greater than 0".into());
        }
        if self.critical_max_retries < self.default_max_retries {
            return Err("critical_max_retries must be at least default_max_retries".into());
        }
        Ok(())
    }

    /// Retry ceiling for a notification.
    #[must_use]
    pub const fn max_retries(&self, critical: bool) -> u32 {
        if critical {
            self.critical_max_retries
        } else {
            self.default_max_retries
        }
    }
}
