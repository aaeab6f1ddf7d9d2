//! Fault isolation for upstream calls: circuit breaker and rate limiter.

pub mod circuit_breaker;
pub mod gate;
pub mod rate_limiter;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerState, CircuitState};
pub use gate::ResilienceGate;
pub use rate_limiter::RateLimiter;
