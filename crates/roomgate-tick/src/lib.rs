//! Timers for Roomgate control loops.
//!
//! Two timers live here, both built to sit inside a `tokio::select!` loop
//! next to [`Multiplexer::wait`](../roomgate_transport/struct.Multiplexer.html):
//!
//! - [`Ticker`]: a fixed-interval housekeeping tick (response-cache
//!   eviction, idle-session sweeps, end of a gameplay round).
//! - [`Deadline`]: a single re-armable deadline, used for a room's
//!   grace period.
//!
//! # Pending forever
//!
//! A disabled ticker or a disarmed deadline returns a future that never
//! resolves. `select!` then simply keeps serving its other branches,
//! so callers never need an `if` around the branch:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         events = mux.wait() => { /* handle events */ }
//!         _ = ticker.tick() => { /* housekeeping */ }
//!         _ = grace.expired() => { /* room is idle */ }
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for a [`Ticker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Time between ticks. `None` disables the ticker.
    pub interval: Option<Duration>,
    /// Random jitter (0–max) added to the *first* tick so that rooms
    /// started at the same instant do not all sweep together.
    pub initial_jitter: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(1)),
            initial_jitter: Duration::from_millis(50),
        }
    }
}

impl TickConfig {
    /// Smallest accepted interval.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

    /// A ticker firing every `interval`, with default jitter.
    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            ..Default::default()
        }
    }

    /// A ticker that never fires.
    pub fn disabled() -> Self {
        Self {
            interval: None,
            initial_jitter: Duration::ZERO,
        }
    }

    /// Clamp out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if let Some(interval) = self.interval.filter(|i| *i < Self::MIN_INTERVAL) {
            warn!(?interval, "tick interval below minimum, clamping");
            self.interval = Some(Self::MIN_INTERVAL);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// Information about one tick, returned by [`Ticker::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickInfo {
    /// Monotonically increasing tick number (starts at 1).
    pub tick: u64,
    /// How many whole intervals were skipped because the loop was busy.
    pub ticks_skipped: u64,
}

/// Fixed-interval ticker.
///
/// Missed ticks are skipped, never replayed: after a stall the next tick
/// is scheduled one interval from *now*.
#[derive(Debug)]
pub struct Ticker {
    interval: Option<Duration>,
    next: Option<Instant>,
    count: u64,
}

impl Ticker {
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();

        let next = config.interval.map(|interval| {
            let jitter_ms = config.initial_jitter.as_millis() as u64;
            let jitter = if jitter_ms > 0 {
                Duration::from_millis(rand::rng().random_range(0..jitter_ms))
            } else {
                Duration::ZERO
            };
            Instant::now() + interval + jitter
        });

        match config.interval {
            Some(interval) => debug!(?interval, "ticker created"),
            None => debug!("ticker created disabled"),
        }

        Self {
            interval: config.interval,
            next,
            count: 0,
        }
    }

    /// A ticker firing every `interval`.
    pub fn every(interval: Duration) -> Self {
        Self::new(TickConfig::every(interval))
    }

    /// Waits for the next tick. Pends forever when disabled.
    ///
    /// Cancel-safe: dropping the future before it resolves leaves the
    /// schedule untouched.
    pub async fn tick(&mut self) -> TickInfo {
        let (next, interval) = match (self.next, self.interval) {
            (Some(next), Some(interval)) => (next, interval),
            _ => std::future::pending().await,
        };

        time::sleep_until(next).await;

        let now = Instant::now();
        let late_by = now.saturating_duration_since(next);
        let ticks_skipped = (late_by.as_nanos() / interval.as_nanos()) as u64;
        if ticks_skipped > 0 {
            debug!(
                tick = self.count + 1,
                skipped = ticks_skipped,
                "ticker fell behind, skipping ahead"
            );
        }

        self.count += 1;
        self.next = Some(now + interval);
        trace!(tick = self.count, "tick");

        TickInfo {
            tick: self.count,
            ticks_skipped,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Ticks fired so far.
    pub fn tick_count(&self) -> u64 {
        self.count
    }
}

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

/// A single deadline that can be armed, disarmed, and re-armed.
///
/// A room server arms its grace deadline when the last client leaves and
/// disarms it when someone connects.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A disarmed deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the deadline `after` from now, replacing any earlier arming.
    pub fn arm(&mut self, after: Duration) {
        self.at = Some(Instant::now() + after);
    }

    /// Arms the deadline only if it is not armed already.
    pub fn arm_if_disarmed(&mut self, after: Duration) {
        if self.at.is_none() {
            self.arm(after);
        }
    }

    pub fn disarm(&mut self) {
        self.at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    /// When the deadline fires, if armed.
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Resolves when the armed deadline passes, disarming it. Pends
    /// forever while disarmed.
    pub async fn expired(&mut self) {
        match self.at {
            Some(at) => {
                time::sleep_until(at).await;
                self.at = None;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_ticks_every_second() {
        let cfg = TickConfig::default();
        assert_eq!(cfg.interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_validated_clamps_zero_interval() {
        let cfg = TickConfig {
            interval: Some(Duration::ZERO),
            initial_jitter: Duration::ZERO,
        }
        .validated();
        assert_eq!(cfg.interval, Some(TickConfig::MIN_INTERVAL));
    }

    #[test]
    fn test_disabled_config_has_no_interval() {
        let ticker = Ticker::new(TickConfig::disabled());
        assert!(!ticker.is_enabled());
        assert_eq!(ticker.tick_count(), 0);
    }

    #[test]
    fn test_deadline_arm_and_disarm() {
        let mut d = Deadline::new();
        assert!(!d.is_armed());
        d.arm(Duration::from_secs(5));
        assert!(d.is_armed());
        d.disarm();
        assert!(!d.is_armed());
        assert!(d.instant().is_none());
    }
}
