//! Circuit breaker guarding one upstream dependency.
//!
//! States:
//! - Closed: calls pass, consecutive failures are counted
//! - Open: calls are rejected with [`OrchestratorError::CircuitOpen`] until the cooldown elapses
//! - HalfOpen: one probe call at a time decides between Closed and Open

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::core::{OrchestratorError, OrchestratorResult};

/// Delay suggested to callers rejected while a half-open probe is running.
const PROBE_BUSY_RETRY: Duration = Duration::from_secs(1);

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Tripped; calls fail fast.
    Open,
    /// Cooldown elapsed; probing recovery.
    HalfOpen,
}

/// Point-in-time view of a breaker, suitable for health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Current position.
    pub state: CircuitState,
    /// Consecutive failures while Closed.
    pub failure_count: u32,
    /// Wall-clock time of the most recent counted failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Successful probes since entering HalfOpen.
    pub success_count_in_half_open: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    success_count_in_half_open: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// Report the call result with [`CallPermit::success`] or
/// [`CallPermit::failure`]. Dropping an unsettled probe permit frees the
/// probe slot without changing the breaker state.
#[must_use = "report the call result through the permit"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is the half-open probe.
    pub const fn is_probe(&self) -> bool {
        self.probe
    }

    /// The dependency answered.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    /// The dependency failed (transient error or timeout).
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.inner.lock().probe_in_flight = false;
            debug!(dependency = %self.breaker.dependency, "half-open probe abandoned");
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                success_count_in_half_open: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Dependency name used in errors and logs.
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Snapshot of the current state.
    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            success_count_in_half_open: inner.success_count_in_half_open,
        }
    }

    /// Ask to make a call.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::CircuitOpen`] while Open, or while HalfOpen with a
    /// probe already in flight.
    pub fn try_acquire(&self) -> OrchestratorResult<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooldown = self.config.cooldown();
                let elapsed = inner.opened_at.map_or(cooldown, |at| at.elapsed());
                if elapsed < cooldown {
                    return Err(self.open_error(cooldown - elapsed));
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count_in_half_open = 0;
                inner.probe_in_flight = true;
                info!(dependency = %self.dependency, "circuit half-open, probing");
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.open_error(PROBE_BUSY_RETRY));
                }
                inner.probe_in_flight = true;
                true
            }
        };
        Ok(CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn open_error(&self, retry_in: Duration) -> OrchestratorError {
        OrchestratorError::CircuitOpen {
            dependency: self.dependency.clone(),
            retry_in,
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                inner.success_count_in_half_open += 1;
                if inner.success_count_in_half_open >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count_in_half_open = 0;
                    inner.opened_at = None;
                    info!(dependency = %self.dependency, "circuit closed after successful probe");
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        dependency = %self.dependency,
                        failures = inner.failure_count,
                        cooldown_ms = self.config.cooldown_ms,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if probe => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                inner.success_count_in_half_open = 0;
                warn!(dependency = %self.dependency, "probe failed, circuit reopened");
            }
            _ => {}
        }
    }
}
