//! Resilient gateway to backend services.
//!
//! Every outbound call goes through three gates, in order: the caller's
//! role quota, the operation's circuit breaker, and a per-call timeout.
//! Breakers are created lazily, one per `service.operation` name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::auth::Role;
use crate::clock::Clock;
use crate::config::{BreakerConfig, RateLimitConfig};
use crate::error::GatewayError;

use super::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use super::rate_limiter::RateLimiter;

/// Rate-limited, circuit-broken, time-bounded backend caller.
#[derive(Debug)]
pub struct BackendGateway {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: BreakerConfig,
    limiter: RateLimiter,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl BackendGateway {
    /// Creates a gateway with no breakers yet.
    #[must_use]
    pub fn new(
        breaker_config: BreakerConfig,
        rate_limit: RateLimitConfig,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            breaker_config,
            limiter: RateLimiter::new(rate_limit, Arc::clone(&clock)),
            timeout,
            clock,
        }
    }

    /// Returns the breaker for `operation`, creating it on first use.
    #[must_use]
    pub fn breaker(&self, operation: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(operation.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                operation,
                self.breaker_config,
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(breaker)
    }

    /// Returns snapshots of every breaker created so far, sorted by name.
    #[must_use]
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let guard = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
            guard.values().map(Arc::clone).collect()
        };
        let mut snapshots: Vec<BreakerSnapshot> =
            breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }

    /// Calls `operation` on behalf of `role`.
    ///
    /// `f` is invoked at most once, and not at all when the call is rate
    /// limited or short-circuited.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::RateLimitExceeded`] when the role's quota is spent.
    /// - [`GatewayError::CircuitOpen`] when the operation's breaker is open.
    /// - [`GatewayError::BackendTimeout`] when `f` does not finish in time.
    /// - [`GatewayError::BackendFailure`] when `f` fails.
    pub async fn call<T, F, Fut>(&self, operation: &str, role: Role, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.limiter.check(role)?;
        let breaker = self.breaker(operation);
        let permit = breaker.try_acquire()?;

        match tokio::time::timeout(self.timeout, f()).await {
            Ok(Ok(value)) => {
                permit.succeed();
                Ok(value)
            }
            Ok(Err(err)) => {
                permit.fail();
                tracing::warn!(operation, error = %err, "backend call failed");
                Err(GatewayError::BackendFailure {
                    operation: operation.to_string(),
                    message: format!("{err:#}"),
                })
            }
            Err(_) => {
                permit.fail();
                tracing::warn!(operation, "backend call timed out");
                Err(GatewayError::BackendTimeout {
                    operation: operation.to_string(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::clock::SystemClock;
    use crate::resilience::CircuitState;

    fn gateway(quota: u32) -> BackendGateway {
        BackendGateway::new(
            BreakerConfig {
                failure_threshold: 2,
                failure_window: Duration::from_secs(60),
                reset_timeout: Duration::from_secs(30),
            },
            RateLimitConfig {
                window: Duration::from_secs(60),
                quotas: HashMap::from([(Role::Viewer, quota)]),
            },
            Duration::from_millis(100),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let gateway = gateway(100);
        for _ in 0..2 {
            let result: Result<(), _> = gateway
                .call("reader-service.snapshot", Role::Viewer, || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
                .await;
            assert!(matches!(result, Err(GatewayError::BackendTimeout { .. })));
        }
        assert_eq!(
            gateway.breaker("reader-service.snapshot").state(),
            CircuitState::Open
        );
    }

    #[tokio::test]
    async fn breakers_are_isolated_per_operation() {
        let gateway = gateway(100);
        for _ in 0..2 {
            let _: Result<(), _> = gateway
                .call("asset-service.snapshot", Role::Viewer, || async {
                    Err(anyhow::anyhow!("boom"))
                })
                .await;
        }
        let other = gateway
            .call("location-service.snapshot", Role::Viewer, || async {
                Ok::<_, anyhow::Error>(1)
            })
            .await;
        assert_eq!(other.ok(), Some(1));
        assert_eq!(gateway.breaker_snapshots().len(), 2);
    }

    #[tokio::test]
    async fn rate_limited_call_is_not_invoked() {
        let gateway = gateway(1);
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            let _ = gateway
                .call("asset-service.snapshot", Role::Viewer, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
