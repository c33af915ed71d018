//! Sliding-window rate limiter keyed by caller role.
//!
//! Each role keeps a log of call instants inside the current window. A call
//! is admitted if fewer than the role's quota are logged; otherwise the
//! caller is told how long until the oldest entry leaves the window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::auth::Role;
use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::GatewayError;

/// Per-role sliding-log rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    logs: Mutex<HashMap<Role, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Creates a limiter with empty logs.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Admits or rejects one call for `role`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimitExceeded`] with a retry hint when
    /// the role's quota for the current window is spent.
    pub fn check(&self, role: Role) -> Result<(), GatewayError> {
        let now = self.clock.now();
        let quota = usize::try_from(self.config.quota_for(role)).unwrap_or(usize::MAX);
        let window = self.config.window;

        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(role).or_default();
        while log
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= window)
        {
            log.pop_front();
        }

        if log.len() < quota {
            log.push_back(now);
            return Ok(());
        }

        let retry_after = log.front().map_or(window, |oldest| {
            window.saturating_sub(now.saturating_duration_since(*oldest))
        });
        tracing::debug!(role = %role, quota, "rate limit exceeded");
        Err(GatewayError::RateLimitExceeded {
            role: role.to_string(),
            retry_after_ms: duration_ms(retry_after),
        })
    }

    /// Returns the number of calls logged for `role` in the current window.
    #[must_use]
    pub fn in_window(&self, role: Role) -> usize {
        let now = self.clock.now();
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.get(&role).map_or(0, |log| {
            log.iter()
                .filter(|at| now.saturating_duration_since(**at) < self.config.window)
                .count()
        })
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
