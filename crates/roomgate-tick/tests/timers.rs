//! Integration tests for the ticker and the grace deadline.
//!
//! Uses `start_paused = true` so Tokio's clock only moves when every task
//! is idle, which makes timing assertions deterministic.

use std::time::Duration;

use roomgate_tick::{Deadline, TickConfig, Ticker};
use tokio::time::{self, Instant};

fn no_jitter(interval: Duration) -> TickConfig {
    TickConfig {
        interval: Some(interval),
        initial_jitter: Duration::ZERO,
    }
}

// =========================================================================
// Ticker
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_ticker_fires_at_interval() {
    let mut ticker = Ticker::new(no_jitter(Duration::from_millis(100)));
    let start = Instant::now();

    let first = ticker.tick().await;
    assert_eq!(first.tick, 1);
    assert_eq!(start.elapsed(), Duration::from_millis(100));

    let second = ticker.tick().await;
    assert_eq!(second.tick, 2);
    assert_eq!(start.elapsed(), Duration::from_millis(200));
    assert_eq!(ticker.tick_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_ticker_skips_missed_ticks_instead_of_bursting() {
    let mut ticker = Ticker::new(no_jitter(Duration::from_millis(100)));

    // The loop is busy for three and a half intervals.
    time::advance(Duration::from_millis(350)).await;

    let info = ticker.tick().await;
    assert_eq!(info.tick, 1);
    assert_eq!(info.ticks_skipped, 2);

    // Next tick is one full interval later, not immediately.
    let before = Instant::now();
    ticker.tick().await;
    assert_eq!(before.elapsed(), Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_initial_jitter_stays_within_bound() {
    let config = TickConfig {
        interval: Some(Duration::from_millis(100)),
        initial_jitter: Duration::from_millis(20),
    };
    let mut ticker = Ticker::new(config);
    let start = Instant::now();
    ticker.tick().await;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(120));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_ticker_never_fires() {
    let mut ticker = Ticker::new(TickConfig::disabled());
    let result = time::timeout(Duration::from_secs(3600), ticker.tick()).await;
    assert!(result.is_err());
}

// =========================================================================
// Deadline
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_deadline_fires_after_arm_and_disarms_itself() {
    let mut grace = Deadline::new();
    grace.arm(Duration::from_secs(5));

    let start = Instant::now();
    grace.expired().await;
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    assert!(!grace.is_armed());
}

#[tokio::test(start_paused = true)]
async fn test_disarmed_deadline_pends_forever() {
    let mut grace = Deadline::new();
    let result = time::timeout(Duration::from_secs(60), grace.expired()).await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_rearm_pushes_deadline_back() {
    let mut grace = Deadline::new();
    grace.arm(Duration::from_secs(5));
    time::advance(Duration::from_secs(3)).await;

    // Occupancy bounced back to zero: restart the full grace period.
    grace.arm(Duration::from_secs(5));
    let start = Instant::now();
    grace.expired().await;
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_in_select_does_not_block_other_branch() {
    let mut grace = Deadline::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(1);
    tx.send(7).await.unwrap();

    let got = tokio::select! {
        _ = grace.expired() => None,
        v = rx.recv() => v,
    };
    assert_eq!(got, Some(7));
}
