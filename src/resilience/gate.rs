//! Breaker + limiter + timeout around every upstream call.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use super::rate_limiter::RateLimiter;
use crate::config::ResilienceConfig;
use crate::core::{OrchestratorError, OrchestratorResult};

/// Process-wide guard for one upstream dependency.
#[derive(Debug)]
pub struct ResilienceGate {
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    call_timeout: Option<Duration>,
}

impl ResilienceGate {
    /// Build a gate for `dependency`.
    pub fn new(dependency: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(dependency, config.circuit_breaker.clone()),
            limiter: RateLimiter::new(&config.rate_limiter),
            call_timeout: config.call_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Run `operation` through the gate.
    ///
    /// Fails fast with [`OrchestratorError::CircuitOpen`] without invoking
    /// `operation` while the breaker is open; otherwise waits for a rate-limit
    /// slot, runs it under the call timeout, and feeds the result back to the
    /// breaker. Only transient failures and timeouts count against the
    /// breaker: a 4xx means the dependency is answering.
    ///
    /// # Errors
    ///
    /// `CircuitOpen`, `Timeout`, or whatever `operation` returned.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> OrchestratorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let permit = self.breaker.try_acquire()?;
        self.limiter.wait_for_slot().await;

        let result = match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, operation())
                .await
                .unwrap_or_else(|_| {
                    Err(OrchestratorError::Timeout(format!(
                        "{} call exceeded {}ms",
                        self.breaker.dependency(),
                        limit.as_millis()
                    )))
                }),
            None => operation().await,
        };

        match &result {
            Err(e) if e.counts_as_upstream_failure() => {
                debug!(dependency = %self.breaker.dependency(), error = %e, "upstream call failed");
                permit.failure();
            }
            _ => permit.success(),
        }
        result
    }

    /// Breaker snapshot.
    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.breaker.snapshot()
    }

    /// Rate limiter, for inspection.
    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}
