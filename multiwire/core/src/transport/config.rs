//! Transport Configuration
//!
//! Settings shared by every carrier. Durations are stored in milliseconds so
//! the struct maps one-to-one onto the `[transport]` table of
//! `multiwire.toml` and onto `MULTIWIRE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::frame::MAX_FRAME_SIZE;
use super::idle::IdleConfig;

/// Default connect/bind timeout
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Default delay before the reconnecting client retries
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;

/// Default replay buffer capacity of the reconnecting client
pub const DEFAULT_REPLAY_CAPACITY: usize = 500;

/// Default cap on accepted stream connections per server
pub const DEFAULT_MAX_CONNECTIONS: usize = 1_024;

/// Transport configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connect timeout in milliseconds; bind reuses it
    pub connect_timeout_ms: u64,

    /// Fire `read_idle` after this many quiet milliseconds (0 = off)
    pub read_idle_ms: u64,

    /// Fire `write_idle` after this many quiet milliseconds (0 = off)
    pub write_idle_ms: u64,

    /// Fire `read_write_idle` after this many quiet milliseconds (0 = off)
    pub all_idle_ms: u64,

    /// Global messages per second across all connections (<= 0 = off)
    pub global_rate_limit: i64,

    /// Fixed delay between reconnect attempts in milliseconds
    pub reconnect_delay_ms: u64,

    /// Messages the reconnecting client holds while disconnected
    pub replay_buffer_capacity: usize,

    /// Largest accepted stream frame in bytes
    pub max_frame_size: usize,

    /// Accepted connections per stream server
    pub max_connections: usize,

    /// Compress packet payloads (needs the `compression` feature on both peers)
    pub compression: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_idle_ms: 0,
            write_idle_ms: 0,
            all_idle_ms: 0,
            global_rate_limit: 0,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            replay_buffer_capacity: DEFAULT_REPLAY_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            compression: false,
        }
    }
}

impl TransportConfig {
    /// Short timeouts for tests on loopback
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            connect_timeout_ms: 1_000,
            reconnect_delay_ms: 100,
            ..Self::default()
        }
    }

    /// Conservative limits for exposed listeners
    #[must_use]
    pub fn strict() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            all_idle_ms: 60_000,
            global_rate_limit: 1_000,
            max_frame_size: 1024 * 1024,
            max_connections: 256,
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Unset or unparsable variables keep their default. Environment
    /// variables:
    /// - `MULTIWIRE_CONNECT_TIMEOUT`: connect/bind timeout in ms
    /// - `MULTIWIRE_READ_IDLE`, `MULTIWIRE_WRITE_IDLE`, `MULTIWIRE_ALL_IDLE`: idle ms
    /// - `MULTIWIRE_RATE_LIMIT`: global messages per second
    /// - `MULTIWIRE_RECONNECT_DELAY`: reconnect delay in ms
    /// - `MULTIWIRE_REPLAY_CAPACITY`: replay buffer size
    /// - `MULTIWIRE_MAX_FRAME_SIZE`: frame limit in bytes
    /// - `MULTIWIRE_MAX_CONNECTIONS`: accepted connection cap
    /// - `MULTIWIRE_COMPRESSION`: "1" or "true" to enable
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overwrite fields that have a matching `MULTIWIRE_*` variable
    ///
    /// Returns how many fields were overridden.
    pub fn apply_env(&mut self) -> usize {
        let mut applied = 0;
        let mut set = |name: &str, apply: &mut dyn FnMut(&str) -> bool| {
            if let Ok(value) = std::env::var(name) {
                if apply(value.trim()) {
                    applied += 1;
                } else {
                    tracing::warn!(
                        var = name,
                        value = %value,
                        "Ignoring unparsable environment override"
                    );
                }
            }
        };

        set("MULTIWIRE_CONNECT_TIMEOUT", &mut |v| {
            parse_into(v, &mut self.connect_timeout_ms)
        });
        set("MULTIWIRE_READ_IDLE", &mut |v| parse_into(v, &mut self.read_idle_ms));
        set("MULTIWIRE_WRITE_IDLE", &mut |v| parse_into(v, &mut self.write_idle_ms));
        set("MULTIWIRE_ALL_IDLE", &mut |v| parse_into(v, &mut self.all_idle_ms));
        set("MULTIWIRE_RATE_LIMIT", &mut |v| {
            parse_into(v, &mut self.global_rate_limit)
        });
        set("MULTIWIRE_RECONNECT_DELAY", &mut |v| {
            parse_into(v, &mut self.reconnect_delay_ms)
        });
        set("MULTIWIRE_REPLAY_CAPACITY", &mut |v| {
            parse_into(v, &mut self.replay_buffer_capacity)
        });
        set("MULTIWIRE_MAX_FRAME_SIZE", &mut |v| {
            parse_into(v, &mut self.max_frame_size)
        });
        set("MULTIWIRE_MAX_CONNECTIONS", &mut |v| {
            parse_into(v, &mut self.max_connections)
        });
        set("MULTIWIRE_COMPRESSION", &mut |v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => {
                self.compression = true;
                true
            }
            "0" | "false" | "no" => {
                self.compression = false;
                true
            }
            _ => false,
        });

        applied
    }

    /// Connect and bind timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect delay
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Idle durations
    #[must_use]
    pub fn idle(&self) -> IdleConfig {
        IdleConfig::from_millis(self.read_idle_ms, self.write_idle_ms, self.all_idle_ms)
    }

    /// Set the connect/bind timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_millis(timeout);
        self
    }

    /// Set all three idle durations (zero disables a kind)
    #[must_use]
    pub fn with_idle(mut self, read: Duration, write: Duration, all: Duration) -> Self {
        self.read_idle_ms = duration_millis(read);
        self.write_idle_ms = duration_millis(write);
        self.all_idle_ms = duration_millis(all);
        self
    }

    /// Set the global rate limit
    #[must_use]
    pub fn with_global_rate_limit(mut self, per_second: i64) -> Self {
        self.global_rate_limit = per_second;
        self
    }

    /// Set the reconnect delay
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = duration_millis(delay);
        self
    }

    /// Set the replay buffer capacity
    #[must_use]
    pub fn with_replay_buffer_capacity(mut self, capacity: usize) -> Self {
        self.replay_buffer_capacity = capacity;
        self
    }

    /// Set the accepted connection cap
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, field: &mut T) -> bool {
    match value.parse() {
        Ok(parsed) => {
            *field = parsed;
            true
        }
        Err(_) => false,
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
