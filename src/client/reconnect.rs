//! Reconnection state machine with capped exponential backoff.
//!
//! ```text
//! Disconnected --begin_attempt--> Connecting --on_connected--> Connected
//!                                  Connecting --on_connect_failed--> Disconnected
//! Connected --on_transport_closed--> Disconnected
//! ```
//!
//! The controller only decides; the session does the sleeping.

use std::fmt;
use std::time::Duration;

use crate::error::GatewayError;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Transport up and acknowledged.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Consecutive failures after which the controller gives up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Returns `min(base × multiplier^attempt, max)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What to do after a failed connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Sleep, then try again.
    RetryAfter(Duration),
    /// Attempts are exhausted.
    GiveUp,
}

/// Tracks state and consecutive failures for one client.
#[derive(Debug, Clone)]
pub struct ReconnectionController {
    policy: RetryPolicy,
    state: ConnectionState,
    attempt: u32,
    exhausted: bool,
}

impl ReconnectionController {
    /// Creates a disconnected controller.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            exhausted: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns `true` once the controller has given up.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// The configured policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Enters `Connecting`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ReconnectExhausted`] if the controller gave
    /// up and has not been [`reset`](Self::reset).
    pub fn begin_attempt(&mut self) -> Result<(), GatewayError> {
        if self.exhausted {
            return Err(GatewayError::ReconnectExhausted {
                attempts: self.attempt,
            });
        }
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Records a successful connect.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
    }

    /// Records a failed connect and decides what happens next.
    pub fn on_connect_failed(&mut self) -> ReconnectDecision {
        self.state = ConnectionState::Disconnected;
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.policy.max_attempts {
            self.exhausted = true;
            tracing::warn!(attempts = self.attempt, "reconnect attempts exhausted");
            return ReconnectDecision::GiveUp;
        }
        tracing::info!(
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "connect failed, retrying"
        );
        ReconnectDecision::RetryAfter(delay)
    }

    /// Records loss of an established transport.
    pub fn on_transport_closed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Clears the failure count and the exhausted flag.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
        self.exhausted = false;
    }
}
