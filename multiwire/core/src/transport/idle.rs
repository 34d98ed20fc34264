//! Idle Detection
//!
//! Per-connection read and write activity tracking that feeds the
//! `read_idle`, `write_idle` and `read_write_idle` handler callbacks.
//!
//! # Semantics
//!
//! - Each kind fires once the connection has been quiet for its duration.
//! - While the connection stays quiet the event fires again every further
//!   duration, never more than once per period.
//! - Any matching activity resets the timer.
//!
//! The reader task and writer task of a connection share one
//! [`IdleTracker`]. The connection task owns the [`IdleDetector`] and polls
//! it from a periodic tick, so callbacks stay on the connection's sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Shortest tick used to poll idle state
const MIN_CHECK_PERIOD: Duration = Duration::from_millis(5);

/// Idle durations for one connection (`None` disables that kind)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Fire `read_idle` after this long without reads
    pub read_idle: Option<Duration>,
    /// Fire `write_idle` after this long without writes
    pub write_idle: Option<Duration>,
    /// Fire `read_write_idle` after this long without either
    pub all_idle: Option<Duration>,
}

impl IdleConfig {
    /// Idle detection disabled
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build from millisecond values, where zero disables a kind
    #[must_use]
    pub fn from_millis(read_ms: u64, write_ms: u64, all_ms: u64) -> Self {
        let opt = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        Self {
            read_idle: opt(read_ms),
            write_idle: opt(write_ms),
            all_idle: opt(all_ms),
        }
    }

    /// Whether any kind is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.read_idle.is_some() || self.write_idle.is_some() || self.all_idle.is_some()
    }

    /// How often the connection task should poll
    ///
    /// A quarter of the shortest enabled duration, so events fire at most
    /// 25% late.
    #[must_use]
    pub fn check_period(&self) -> Option<Duration> {
        [self.read_idle, self.write_idle, self.all_idle]
            .into_iter()
            .flatten()
            .min()
            .map(|shortest| (shortest / 4).max(MIN_CHECK_PERIOD))
    }
}

/// Idle kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdleEvent {
    /// No reads
    ReadIdle,
    /// No writes
    WriteIdle,
    /// Neither reads nor writes
    ReadWriteIdle,
}

/// Lock-free activity timestamps shared by reader and writer tasks
#[derive(Debug)]
pub struct IdleTracker {
    epoch: Instant,
    last_read: AtomicU64,
    last_write: AtomicU64,
}

impl IdleTracker {
    /// Start tracking with both timestamps at `now`
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
        })
    }

    fn offset(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_micros()).unwrap_or(u64::MAX)
    }

    fn instant(&self, offset: u64) -> Instant {
        self.epoch + Duration::from_micros(offset)
    }

    /// Bytes were read
    pub fn record_read(&self) {
        self.record_read_at(Instant::now());
    }

    /// Bytes were written
    pub fn record_write(&self) {
        self.record_write_at(Instant::now());
    }

    fn record_read_at(&self, at: Instant) {
        self.last_read.fetch_max(self.offset(at), Ordering::Relaxed);
    }

    fn record_write_at(&self, at: Instant) {
        self.last_write.fetch_max(self.offset(at), Ordering::Relaxed);
    }

    /// Last read time
    #[must_use]
    pub fn last_read(&self) -> Instant {
        self.instant(self.last_read.load(Ordering::Relaxed))
    }

    /// Last write time
    #[must_use]
    pub fn last_write(&self) -> Instant {
        self.instant(self.last_write.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
struct KindState {
    last_fired: Option<Instant>,
}

impl KindState {
    fn poll(&mut self, duration: Option<Duration>, last_activity: Instant, now: Instant) -> bool {
        let Some(duration) = duration else {
            return false;
        };
        let since = match self.last_fired {
            Some(fired) if fired > last_activity => fired,
            _ => last_activity,
        };
        if now.saturating_duration_since(since) >= duration {
            self.last_fired = Some(now);
            true
        } else {
            false
        }
    }
}

/// Decides which idle events are due
#[derive(Debug)]
pub struct IdleDetector {
    config: IdleConfig,
    tracker: Arc<IdleTracker>,
    read: KindState,
    write: KindState,
    all: KindState,
}

impl IdleDetector {
    /// Create a detector over a shared tracker
    #[must_use]
    pub fn new(config: IdleConfig, tracker: Arc<IdleTracker>) -> Self {
        Self {
            config,
            tracker,
            read: KindState::default(),
            write: KindState::default(),
            all: KindState::default(),
        }
    }

    /// The shared tracker
    #[must_use]
    pub fn tracker(&self) -> &Arc<IdleTracker> {
        &self.tracker
    }

    /// Events due now
    pub fn poll(&mut self) -> Vec<IdleEvent> {
        self.poll_at(Instant::now())
    }

    fn poll_at(&mut self, now: Instant) -> Vec<IdleEvent> {
        let last_read = self.tracker.last_read();
        let last_write = self.tracker.last_write();

        let mut due = Vec::new();
        if self.read.poll(self.config.read_idle, last_read, now) {
            due.push(IdleEvent::ReadIdle);
        }
        if self.write.poll(self.config.write_idle, last_write, now) {
            due.push(IdleEvent::WriteIdle);
        }
        if self
            .all
            .poll(self.config.all_idle, last_read.max(last_write), now)
        {
            due.push(IdleEvent::ReadWriteIdle);
        }
        due
    }
}

/// Periodic driver for an [`IdleDetector`] inside a connection task
///
/// `due` is cancel-safe, so it can sit in a `select!` next to reads.
#[derive(Debug)]
pub(crate) struct IdleTimer {
    detector: IdleDetector,
    interval: Option<tokio::time::Interval>,
}

impl IdleTimer {
    pub(crate) fn new(config: IdleConfig, tracker: Arc<IdleTracker>) -> Self {
        let interval = config.check_period().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        Self {
            detector: IdleDetector::new(config, tracker),
            interval,
        }
    }

    /// Wait for the next tick and return the events due; never resolves
    /// when idle detection is disabled
    pub(crate) async fn due(&mut self) -> Vec<IdleEvent> {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
                self.detector.poll()
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_config_from_millis() {
        let config = IdleConfig::from_millis(100, 0, 300);
        assert_eq!(config.read_idle, Some(ms(100)));
        assert_eq!(config.write_idle, None);
        assert_eq!(config.all_idle, Some(ms(300)));
        assert!(config.is_enabled());
        assert_eq!(config.check_period(), Some(ms(25)));
    }

    #[test]
    fn test_disabled_config() {
        let config = IdleConfig::disabled();
        assert!(!config.is_enabled());
        assert_eq!(config.check_period(), None);
    }

    #[test]
    fn test_check_period_floor() {
        let config = IdleConfig::from_millis(8, 0, 0);
        assert_eq!(config.check_period(), Some(MIN_CHECK_PERIOD));
    }

    #[test]
    fn test_read_idle_fires_once_per_period() {
        let tracker = IdleTracker::shared();
        let start = tracker.epoch;
        let mut detector = IdleDetector::new(IdleConfig::from_millis(100, 0, 0), tracker);

        assert!(detector.poll_at(start + ms(50)).is_empty());
        assert_eq!(detector.poll_at(start + ms(100)), vec![IdleEvent::ReadIdle]);
        // Same period: no repeat
        assert!(detector.poll_at(start + ms(150)).is_empty());
        // Next period
        assert_eq!(detector.poll_at(start + ms(200)), vec![IdleEvent::ReadIdle]);
    }

    #[test]
    fn test_activity_resets_timer() {
        let tracker = IdleTracker::shared();
        let start = tracker.epoch;
        let mut detector =
            IdleDetector::new(IdleConfig::from_millis(100, 0, 0), Arc::clone(&tracker));

        tracker.record_read_at(start + ms(90));
        assert!(detector.poll_at(start + ms(120)).is_empty());
        assert_eq!(detector.poll_at(start + ms(190)), vec![IdleEvent::ReadIdle]);
    }

    #[test]
    fn test_write_activity_does_not_reset_read_idle() {
        let tracker = IdleTracker::shared();
        let start = tracker.epoch;
        let mut detector =
            IdleDetector::new(IdleConfig::from_millis(100, 100, 100), Arc::clone(&tracker));

        tracker.record_write_at(start + ms(80));
        let due = detector.poll_at(start + ms(110));
        assert_eq!(due, vec![IdleEvent::ReadIdle]);

        let due = detector.poll_at(start + ms(180));
        assert_eq!(due, vec![IdleEvent::WriteIdle, IdleEvent::ReadWriteIdle]);
    }

    #[tokio::test]
    async fn test_timer_reports_due_events() {
        let tracker = IdleTracker::shared();
        let mut timer = IdleTimer::new(IdleConfig::from_millis(20, 0, 0), tracker);

        let events = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let due = timer.due().await;
                if !due.is_empty() {
                    return due;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(events, vec![IdleEvent::ReadIdle]);
    }

    #[tokio::test]
    async fn test_disabled_timer_never_ticks() {
        let mut timer = IdleTimer::new(IdleConfig::disabled(), IdleTracker::shared());
        let result = tokio::time::timeout(ms(30), timer.due()).await;
        assert!(result.is_err());
    }
}
