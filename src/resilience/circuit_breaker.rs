//! Circuit breaker for a single named backend operation.
//!
//! ## States
//!
//! - **Closed**: calls flow through; failures are counted in a rolling window.
//! - **Open**: calls are rejected immediately without touching the backend.
//! - **Half-Open**: exactly one trial call is in flight.
//!
//! ## Transitions
//!
//! ```text
//! Closed    --[failure_threshold failures within failure_window]--> Open
//! Open      --[reset_timeout elapsed since last failure]----------> Half-Open
//! Half-Open --[trial succeeds]-----------------------------------> Closed
//! Half-Open --[trial fails or is abandoned]----------------------> Open
//! ```
//!
//! All transitions happen under the breaker's mutex, so the move into
//! half-open and the single trial permit are serialized.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::error::GatewayError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// One trial call allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    failures: VecDeque<Instant>,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
}

/// Point-in-time view of a breaker, for stats endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// Operation name.
    pub operation: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Failures inside the rolling window.
    pub window_failures: usize,
    /// Times the breaker has opened since creation.
    pub times_opened: u64,
}

/// Breaker protecting one `service.operation`.
#[derive(Debug)]
pub struct CircuitBreaker {
    operation: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(operation: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            operation: operation.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                failures: VecDeque::new(),
                last_failure: None,
                trial_in_flight: false,
                times_opened: 0,
            }),
        }
    }

    /// Returns the protected operation name.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current state, applying the open → half-open timer.
    ///
    /// Reading the state never grants a trial permit.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        if inner.state == CircuitState::Open && self.reset_elapsed(&inner, self.clock.now()) {
            CircuitState::HalfOpen
        } else {
            inner.state
        }
    }

    /// Returns a snapshot of the breaker's counters.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.lock();
        BreakerSnapshot {
            operation: self.operation.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            window_failures: inner.failures.len(),
            times_opened: inner.times_opened,
        }
    }

    fn reset_elapsed(&self, inner: &BreakerInner, now: Instant) -> bool {
        inner
            .last_failure
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.reset_timeout)
    }

    fn retry_after(&self, inner: &BreakerInner, now: Instant) -> Duration {
        inner.last_failure.map_or(Duration::ZERO, |at| {
            self.config
                .reset_timeout
                .saturating_sub(now.saturating_duration_since(at))
        })
    }

    fn open_error(&self, retry_after: Duration) -> GatewayError {
        GatewayError::CircuitOpen {
            operation: self.operation.clone(),
            retry_after_ms: u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Asks permission for one call.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CircuitOpen`] while the circuit is open, or
    /// while a half-open trial is already in flight.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, GatewayError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(Arc::clone(self), false)),
            CircuitState::Open => {
                if self.reset_elapsed(&inner, now) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(operation = %self.operation, "circuit half-open, admitting trial call");
                    Ok(BreakerPermit::new(Arc::clone(self), true))
                } else {
                    Err(self.open_error(self.retry_after(&inner, now)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(Arc::clone(self), true))
                }
            }
        }
    }

    /// Returns `true` if an outcome must not touch the breaker: while
    /// half-open only the trial decides.
    fn ignores_outcome(&self, inner: &BreakerInner, trial: bool) -> bool {
        let ignored = !trial && inner.state == CircuitState::HalfOpen;
        if ignored {
            tracing::debug!(operation = %self.operation, "ignoring late outcome while half-open");
        }
        ignored
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        if self.ignores_outcome(&inner, trial) {
            return;
        }
        inner.consecutive_failures = 0;
        if trial {
            inner.state = CircuitState::Closed;
            inner.failures.clear();
            inner.last_failure = None;
            inner.trial_in_flight = false;
            tracing::info!(operation = %self.operation, "circuit closed after successful trial");
        }
    }

    fn record_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if self.ignores_outcome(&inner, trial) {
            return;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);
        inner.failures.push_back(now);
        let window = self.config.failure_window;
        while inner
            .failures
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            inner.failures.pop_front();
        }

        let trip = if trial {
            inner.trial_in_flight = false;
            true
        } else {
            inner.state == CircuitState::Closed
                && inner.failures.len() >= usize::try_from(self.config.failure_threshold).unwrap_or(usize::MAX)
        };

        if trip && inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            inner.times_opened = inner.times_opened.saturating_add(1);
            tracing::warn!(
                operation = %self.operation,
                consecutive_failures = inner.consecutive_failures,
                reset_timeout_ms = u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX),
                "circuit opened"
            );
        }
    }

    /// Runs `f` under the breaker.
    ///
    /// `f` is not invoked when the circuit rejects the call.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CircuitOpen`] on rejection, or
    /// [`GatewayError::BackendFailure`] if `f` fails.
    pub async fn call<T, F, Fut>(self: &Arc<Self>, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let permit = self.try_acquire()?;
        match f().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(GatewayError::BackendFailure {
                    operation: self.operation.clone(),
                    message: format!("{err:#}"),
                })
            }
        }
    }
}

/// Permission for one call. Must be settled with [`succeed`](Self::succeed)
/// or [`fail`](Self::fail); dropping it unsettled counts as a failure.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    const fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Returns `true` if this permit is the half-open trial.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    /// Records a successful call.
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    /// Records a failed call.
    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(operation = %self.breaker.operation, "breaker permit abandoned");
            self.breaker.record_failure(self.trial);
        }
    }
}
