//! Gateway configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`) and fall back to defaults when unset or
//! unparsable. Each component receives only its own sub-configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, bail};

use crate::auth::Role;

/// Heartbeat liveness settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Expected interval between client heartbeats.
    pub interval: Duration,
    /// Consecutive missed heartbeats that trigger teardown.
    pub missed_threshold: u32,
}

impl HeartbeatConfig {
    /// Idle time after which a connection is considered stale.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.interval.saturating_mul(self.missed_threshold)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            missed_threshold: 3,
        }
    }
}

/// Broadcaster batching and compression settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Rolling window measured from the first buffered event.
    pub window: Duration,
    /// Buffer size that forces an immediate flush.
    pub max_batch_size: usize,
    /// How often the driver checks for due buffers.
    pub flush_tick: Duration,
    /// Serialized size above which a compressed rendition is produced.
    pub compression_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(100),
            max_batch_size: 50,
            flush_tick: Duration::from_millis(25),
            compression_threshold: 1024,
        }
    }
}

/// Circuit breaker settings, shared by every named breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Rolling window over which failures are counted.
    pub failure_window: Duration,
    /// Time after the last failure before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-role sliding-window quotas for backend calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Sliding window length.
    pub window: Duration,
    /// Maximum calls per window, per role.
    pub quotas: HashMap<Role, u32>,
}

impl RateLimitConfig {
    /// Returns the quota for a role. Roles without an entry get zero.
    #[must_use]
    pub fn quota_for(&self, role: Role) -> u32 {
        self.quotas.get(&role).copied().unwrap_or(0)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            quotas: HashMap::from([
                (Role::Admin, 600),
                (Role::Operator, 300),
                (Role::Viewer, 120),
            ]),
        }
    }
}

/// Top-level gateway configuration.
///
/// Loaded once at startup via [`GatewayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:3000`).
    pub listen_addr: SocketAddr,

    /// Emit JSON logs instead of human-readable ones.
    pub log_json: bool,

    /// Maximum number of concurrent WebSocket connections.
    pub max_connections: usize,

    /// Capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,

    /// Heartbeat liveness settings.
    pub heartbeat: HeartbeatConfig,

    /// Bound on how long a subscribe may wait for the registry.
    pub subscribe_timeout: Duration,

    /// Batching and compression settings.
    pub batch: BatchConfig,

    /// Circuit breaker settings.
    pub breaker: BreakerConfig,

    /// Per-role backend call quotas.
    pub rate_limit: RateLimitConfig,

    /// Timeout applied to every backend call.
    pub backend_timeout: Duration,

    /// Base URL of the snapshot service. Snapshots are disabled when unset.
    pub snapshot_base_url: Option<String>,

    /// `token:subject:role` entries for the static token validator.
    pub auth_tokens: String,

    /// Capacity of the EventBus broadcast channel.
    pub event_bus_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            log_json: false,
            max_connections: 10_000,
            outbound_queue_capacity: 256,
            heartbeat: HeartbeatConfig::default(),
            subscribe_timeout: Duration::from_secs(5),
            batch: BatchConfig::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            backend_timeout: Duration::from_millis(5000),
            snapshot_base_url: None,
            auth_tokens: String::new(),
            event_bus_capacity: 10_000,
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `LISTEN_ADDR` cannot be parsed or a loaded value
    /// fails validation.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`GatewayConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let listen_addr: SocketAddr = match lookup("LISTEN_ADDR") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("LISTEN_ADDR is not a socket address: {raw}"))?,
            None => defaults.listen_addr,
        };

        let log_json = lookup("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json"));

        let heartbeat = HeartbeatConfig {
            interval: Duration::from_secs(parse_env(&lookup, "HEARTBEAT_INTERVAL_SECS", 30)),
            missed_threshold: parse_env(&lookup, "HEARTBEAT_MISSED_THRESHOLD", 3),
        };

        let batch = BatchConfig {
            window: Duration::from_millis(parse_env(&lookup, "BATCH_WINDOW_MS", 100)),
            max_batch_size: parse_env(&lookup, "BATCH_MAX_SIZE", 50),
            flush_tick: Duration::from_millis(parse_env(&lookup, "BATCH_FLUSH_TICK_MS", 25)),
            compression_threshold: parse_env(&lookup, "COMPRESSION_THRESHOLD_BYTES", 1024),
        };

        let breaker = BreakerConfig {
            failure_threshold: parse_env(&lookup, "BREAKER_FAILURE_THRESHOLD", 5),
            failure_window: Duration::from_secs(parse_env(
                &lookup,
                "BREAKER_FAILURE_WINDOW_SECS",
                60,
            )),
            reset_timeout: Duration::from_secs(parse_env(&lookup, "BREAKER_RESET_TIMEOUT_SECS", 30)),
        };

        let rate_limit = RateLimitConfig {
            window: Duration::from_secs(parse_env(&lookup, "RATE_LIMIT_WINDOW_SECS", 60)),
            quotas: HashMap::from([
                (Role::Admin, parse_env(&lookup, "RATE_LIMIT_ADMIN", 600)),
                (Role::Operator, parse_env(&lookup, "RATE_LIMIT_OPERATOR", 300)),
                (Role::Viewer, parse_env(&lookup, "RATE_LIMIT_VIEWER", 120)),
            ]),
        };

        let config = Self {
            listen_addr,
            log_json,
            max_connections: parse_env(&lookup, "MAX_CONNECTIONS", defaults.max_connections),
            outbound_queue_capacity: parse_env(
                &lookup,
                "OUTBOUND_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            ),
            heartbeat,
            subscribe_timeout: Duration::from_millis(parse_env(
                &lookup,
                "SUBSCRIBE_TIMEOUT_MS",
                5000,
            )),
            batch,
            breaker,
            rate_limit,
            backend_timeout: Duration::from_millis(parse_env(&lookup, "BACKEND_TIMEOUT_MS", 5000)),
            snapshot_base_url: lookup("SNAPSHOT_BASE_URL").filter(|v| !v.trim().is_empty()),
            auth_tokens: lookup("AUTH_TOKENS").unwrap_or_default(),
            event_bus_capacity: parse_env(&lookup, "EVENT_BUS_CAPACITY", defaults.event_bus_capacity),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make the gateway misbehave.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("MAX_CONNECTIONS must be at least 1");
        }
        if self.outbound_queue_capacity == 0 {
            bail!("OUTBOUND_QUEUE_CAPACITY must be at least 1");
        }
        if self.heartbeat.interval.is_zero() || self.heartbeat.missed_threshold == 0 {
            bail!("heartbeat interval and missed threshold must be positive");
        }
        if self.batch.max_batch_size == 0 {
            bail!("BATCH_MAX_SIZE must be at least 1");
        }
        if self.batch.window.is_zero() || self.batch.flush_tick.is_zero() {
            bail!("batch window and flush tick must be positive");
        }
        if self.breaker.failure_threshold == 0 {
            bail!("BREAKER_FAILURE_THRESHOLD must be at least 1");
        }
        if self.event_bus_capacity == 0 {
            bail!("EVENT_BUS_CAPACITY must be at least 1");
        }
        Ok(())
    }
}

/// Parses a variable as `T`, returning `default` on missing or invalid
/// values.
fn parse_env<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = GatewayConfig::from_lookup(|_| None);
        assert!(config.is_ok());
        let config = config.unwrap_or_default();
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
        assert_eq!(config.batch.window, Duration::from_millis(100));
        assert_eq!(config.backend_timeout, Duration::from_millis(5000));
        assert!(config.snapshot_base_url.is_none());
    }

    #[test]
    fn values_override_defaults() {
        let lookup = lookup_from(&[
            ("LISTEN_ADDR", "127.0.0.1:9000"),
            ("MAX_CONNECTIONS", "2"),
            ("HEARTBEAT_INTERVAL_SECS", "10"),
            ("RATE_LIMIT_VIEWER", "7"),
            ("LOG_FORMAT", "JSON"),
            ("SNAPSHOT_BASE_URL", "http://snapshots.internal"),
        ]);
        let config = GatewayConfig::from_lookup(lookup).unwrap_or_default();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.heartbeat.stale_after(), Duration::from_secs(30));
        assert_eq!(config.rate_limit.quota_for(Role::Viewer), 7);
        assert!(config.log_json);
        assert_eq!(
            config.snapshot_base_url.as_deref(),
            Some("http://snapshots.internal")
        );
    }

    #[test]
    fn garbage_numbers_fall_back() {
        let lookup = lookup_from(&[("BATCH_MAX_SIZE", "lots")]);
        let config = GatewayConfig::from_lookup(lookup).unwrap_or_default();
        assert_eq!(config.batch.max_batch_size, 50);
    }

    #[test]
    fn invalid_listen_addr_is_an_error() {
        let lookup = lookup_from(&[("LISTEN_ADDR", "not-an-addr")]);
        assert!(GatewayConfig::from_lookup(lookup).is_err());
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let lookup = lookup_from(&[("MAX_CONNECTIONS", "0")]);
        assert!(GatewayConfig::from_lookup(lookup).is_err());
    }
}
