//! Transport Rate Limiting
//!
//! Two independent gates sit between decode and dispatch:
//!
//! - **Global**: one token bucket shared by every connection of a transport.
//!   A message that finds no token is dropped.
//! - **Per protocol type**: the last-accepted timestamp of each protocol id.
//!   A message arriving before its type's minimum interval has elapsed is
//!   dropped.
//!
//! Gates apply in that order. Rejected traffic is never queued.
//!
//! # Design
//!
//! The bucket holds one second's worth of tokens (`rate`), starts full and
//! refills continuously. Tokens are stored in thousandths and refilled per
//! whole millisecond; the sub-millisecond remainder carries over to the next
//! refill.
//!
//! Per-type timestamps live in an immutable map built from the registry, so
//! every slot is a lone `AtomicU64`. Accepting a message is a
//! compare-and-swap on that slot: when two connections race for the same
//! window only one of them wins it.
//!
//! # Usage
//!
//! ```
//! use multiwire_core::protocol::ProtocolRegistry;
//! use multiwire_core::transport::rate_limit::TransportRateLimiter;
//!
//! let registry = ProtocolRegistry::new();
//! // 100 messages per second across all connections
//! let limiter = TransportRateLimiter::new(100, &registry);
//! assert!(limiter.check(1).is_allowed());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::ProtocolRegistry;

/// Token precision multiplier
const MILLIS_PER_TOKEN: u64 = 1000;

fn nanos_between(earlier: Instant, later: Instant) -> u64 {
    u64::try_from(later.saturating_duration_since(earlier).as_nanos()).unwrap_or(u64::MAX)
}

// =============================================================================
// Check Result
// =============================================================================

/// Outcome of passing a message through both gates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Both gates passed
    Allowed,

    /// No global token was available
    GlobalRejected,

    /// The type's minimum interval has not elapsed
    ProtocolRejected {
        /// The declared interval
        interval: Duration,
    },
}

impl RateLimitResult {
    /// Whether the message may be dispatched
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

// =============================================================================
// Global Token Bucket
// =============================================================================

/// Token bucket shared by every connection of one transport
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens added per second, also the bucket capacity
    rate: u64,

    /// Current token count (scaled by 1000)
    tokens_millis: AtomicU64,

    /// Last time tokens were refilled
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    /// Create a full bucket refilled at `rate` tokens per second
    #[must_use]
    pub fn new(rate: u32) -> Self {
        Self::starting_at(rate, Instant::now())
    }

    fn starting_at(rate: u32, now: Instant) -> Self {
        let rate = u64::from(rate);
        Self {
            rate,
            tokens_millis: AtomicU64::new(rate * MILLIS_PER_TOKEN),
            last_refill: Mutex::new(now),
        }
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        self.refill_tokens(now);

        let mut current = self.tokens_millis.load(Ordering::SeqCst);
        loop {
            if current < MILLIS_PER_TOKEN {
                return false;
            }
            match self.tokens_millis.compare_exchange_weak(
                current,
                current - MILLIS_PER_TOKEN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Refill tokens based on elapsed time
    fn refill_tokens(&self, now: Instant) {
        let mut last_refill = self.last_refill.lock();

        let elapsed_ms = u64::try_from(now.saturating_duration_since(*last_refill).as_millis())
            .unwrap_or(u64::MAX);
        if elapsed_ms == 0 {
            return;
        }

        // rate tokens/s == rate millitokens/ms
        let tokens_to_add = self.rate.saturating_mul(elapsed_ms);
        let max_tokens_millis = self.rate * MILLIS_PER_TOKEN;

        let _ = self
            .tokens_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(tokens_to_add).min(max_tokens_millis))
            });

        // A full second refills the whole bucket, so nothing is left to carry
        if elapsed_ms >= 1000 {
            *last_refill = now;
        } else {
            *last_refill += Duration::from_millis(elapsed_ms);
        }
    }

    /// Whole tokens currently available
    #[must_use]
    pub fn available_tokens(&self) -> u64 {
        self.tokens_millis.load(Ordering::SeqCst) / MILLIS_PER_TOKEN
    }

    /// Configured rate
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.rate
    }
}

// =============================================================================
// Per-Protocol Interval Limiter
// =============================================================================

#[derive(Debug)]
struct IntervalSlot {
    interval: Duration,
    interval_nanos: u64,
    /// Nanos since limiter epoch plus one; zero means never accepted
    last_accepted: AtomicU64,
}

/// Minimum-interval throttle keyed by protocol id
#[derive(Debug)]
pub struct ProtocolIntervalLimiter {
    epoch: Instant,
    slots: HashMap<u32, IntervalSlot>,
}

impl ProtocolIntervalLimiter {
    /// Build slots for every registered type with a non-zero interval
    #[must_use]
    pub fn from_registry(registry: &ProtocolRegistry) -> Self {
        let slots = registry
            .entries()
            .filter(|entry| !entry.min_interval().is_zero())
            .map(|entry| {
                let interval = entry.min_interval();
                (
                    entry.id(),
                    IntervalSlot {
                        interval,
                        interval_nanos: u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX),
                        last_accepted: AtomicU64::new(0),
                    },
                )
            })
            .collect();

        Self {
            epoch: Instant::now(),
            slots,
        }
    }

    /// Limiter with no throttled types
    #[must_use]
    pub fn empty() -> Self {
        Self {
            epoch: Instant::now(),
            slots: HashMap::new(),
        }
    }

    /// Number of throttled protocol types
    #[must_use]
    pub fn throttled_types(&self) -> usize {
        self.slots.len()
    }

    /// Try to accept one message of `protocol_id`
    ///
    /// Returns the declared interval when rejected.
    pub fn check(&self, protocol_id: u32) -> Result<(), Duration> {
        self.check_at(protocol_id, Instant::now())
    }

    fn check_at(&self, protocol_id: u32, now: Instant) -> Result<(), Duration> {
        let Some(slot) = self.slots.get(&protocol_id) else {
            return Ok(());
        };

        let now_mark = nanos_between(self.epoch, now).saturating_add(1);
        let mut last = slot.last_accepted.load(Ordering::SeqCst);
        loop {
            if last != 0 && now_mark.saturating_sub(last) < slot.interval_nanos {
                return Err(slot.interval);
            }
            match slot.last_accepted.compare_exchange(
                last,
                now_mark,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => last = actual,
            }
        }
    }
}

// =============================================================================
// Transport Rate Limiter
// =============================================================================

/// Snapshot of limiter counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateLimitMetrics {
    /// Messages that passed both gates
    pub accepted: u64,
    /// Messages dropped by the global bucket
    pub global_rejected: u64,
    /// Messages dropped by a per-type interval
    pub protocol_rejected: u64,
}

/// Both gates for one transport
#[derive(Debug)]
pub struct TransportRateLimiter {
    global: Option<TokenBucket>,
    protocols: ProtocolIntervalLimiter,
    accepted: AtomicU64,
    global_rejected: AtomicU64,
    protocol_rejected: AtomicU64,
}

impl TransportRateLimiter {
    /// Create from a global rate (messages per second, `<= 0` disables) and
    /// the intervals declared in `registry`
    #[must_use]
    pub fn new(global_rate: i64, registry: &ProtocolRegistry) -> Self {
        let global = u32::try_from(global_rate)
            .ok()
            .filter(|rate| *rate > 0)
            .map(TokenBucket::new);

        Self {
            global,
            protocols: ProtocolIntervalLimiter::from_registry(registry),
            accepted: AtomicU64::new(0),
            global_rejected: AtomicU64::new(0),
            protocol_rejected: AtomicU64::new(0),
        }
    }

    /// Limiter that lets everything through
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            global: None,
            protocols: ProtocolIntervalLimiter::empty(),
            accepted: AtomicU64::new(0),
            global_rejected: AtomicU64::new(0),
            protocol_rejected: AtomicU64::new(0),
        }
    }

    /// Whether the global gate is on
    #[must_use]
    pub fn has_global_limit(&self) -> bool {
        self.global.is_some()
    }

    /// Run one message of `protocol_id` through both gates
    pub fn check(&self, protocol_id: u32) -> RateLimitResult {
        self.check_at(protocol_id, Instant::now())
    }

    fn check_at(&self, protocol_id: u32, now: Instant) -> RateLimitResult {
        if let Some(bucket) = &self.global {
            if !bucket.try_acquire_at(now) {
                self.global_rejected.fetch_add(1, Ordering::Relaxed);
                return RateLimitResult::GlobalRejected;
            }
        }

        if let Err(interval) = self.protocols.check_at(protocol_id, now) {
            self.protocol_rejected.fetch_add(1, Ordering::Relaxed);
            return RateLimitResult::ProtocolRejected { interval };
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        RateLimitResult::Allowed
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> RateLimitMetrics {
        RateLimitMetrics {
            accepted: self.accepted.load(Ordering::Relaxed),
            global_rejected: self.global_rejected.load(Ordering::Relaxed),
            protocol_rejected: self.protocol_rejected.load(Ordering::Relaxed),
        }
    }
}
