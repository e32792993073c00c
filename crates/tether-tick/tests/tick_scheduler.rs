//! Pacing decisions, checked with synthetic instants through
//! `poll_tick_at`. One test sleeps for real.

use std::time::{Duration, Instant};

use tether_tick::{TickConfig, TickScheduler};

const PERIOD: Duration = Duration::from_millis(50);

fn at(start: Instant, millis: u64) -> Instant {
    start + Duration::from_millis(millis)
}

// =========================================================================
// TickConfig
// =========================================================================

#[test]
fn test_zero_rate_has_no_duration() {
    assert_eq!(TickConfig::default().tick_rate_hz, 0);
    assert_eq!(TickConfig::default().tick_duration(), None);
    assert_eq!(TickConfig::with_rate(20).tick_duration(), Some(PERIOD));
}

#[test]
fn test_validated_caps_rate() {
    let config = TickConfig::with_rate(1_000).validated();
    assert_eq!(config.tick_rate_hz, TickConfig::MAX_TICK_RATE_HZ);
    assert_eq!(TickConfig::with_rate(60).validated().tick_rate_hz, 60);
}

#[test]
fn test_config_reads_json() {
    let config: TickConfig = serde_json::from_str(r#"{"tick_rate_hz": 30}"#).expect("valid config");
    assert_eq!(config, TickConfig::with_rate(30));

    let config: TickConfig = serde_json::from_str("{}").expect("empty config");
    assert_eq!(config, TickConfig::default());
}

// =========================================================================
// Scheduling
// =========================================================================

#[test]
fn test_first_poll_fires_and_sets_deadline() {
    let mut pacer = TickScheduler::with_rate(20);
    let start = Instant::now();
    assert_eq!(pacer.next_tick(), None);

    let tick = pacer.poll_tick_at(start).expect("first tick");
    assert_eq!(tick.tick, 1);
    assert_eq!(tick.dt, PERIOD);
    assert_eq!(tick.ticks_skipped, 0);
    assert_eq!(pacer.next_tick(), Some(at(start, 50)));
}

#[test]
fn test_no_tick_before_deadline() {
    let mut pacer = TickScheduler::with_rate(20);
    let start = Instant::now();
    assert!(pacer.poll_tick_at(start).is_some());
    assert_eq!(pacer.poll_tick_at(at(start, 10)), None);
    assert_eq!(pacer.poll_tick_at(at(start, 49)), None);
    assert_eq!(pacer.tick_count(), 1);
}

#[test]
fn test_slightly_late_ticks_keep_cadence() {
    let mut pacer = TickScheduler::with_rate(20);
    let start = Instant::now();
    pacer.poll_tick_at(start);

    let tick = pacer.poll_tick_at(at(start, 60)).expect("second tick");
    assert_eq!(tick.tick, 2);
    assert_eq!(tick.ticks_skipped, 0);
    // Lateness below one period does not shift the schedule.
    assert_eq!(pacer.next_tick(), Some(at(start, 100)));
}

#[test]
fn test_far_behind_skips_and_restarts_schedule() {
    let mut pacer = TickScheduler::with_rate(20);
    let start = Instant::now();
    pacer.poll_tick_at(start);

    let tick = pacer.poll_tick_at(at(start, 230)).expect("late tick");
    assert_eq!(tick.tick, 2);
    assert_eq!(tick.ticks_skipped, 3);
    assert_eq!(pacer.skipped(), 3);
    assert_eq!(pacer.next_tick(), Some(at(start, 280)));

    assert_eq!(pacer.poll_tick_at(at(start, 250)), None);
    let tick = pacer.poll_tick_at(at(start, 280)).expect("back on schedule");
    assert_eq!(tick.tick, 3);
    assert_eq!(tick.ticks_skipped, 0);
    assert_eq!(pacer.skipped(), 3);
}

#[test]
fn test_zero_rate_never_ticks() {
    let mut pacer = TickScheduler::new(TickConfig::default());
    assert!(pacer.is_event_driven());
    assert_eq!(pacer.poll_tick(), None);
    assert_eq!(pacer.wait_for_tick(), None);
    assert_eq!(pacer.tick_count(), 0);
    assert_eq!(pacer.next_tick(), None);
}

#[test]
fn test_excessive_rate_is_capped() {
    let pacer = TickScheduler::with_rate(10_000);
    assert_eq!(pacer.tick_rate_hz(), TickConfig::MAX_TICK_RATE_HZ);
    assert_eq!(
        pacer.tick_duration(),
        TickConfig::with_rate(TickConfig::MAX_TICK_RATE_HZ).tick_duration()
    );
}

// =========================================================================
// Real clock
// =========================================================================

#[test]
fn test_wait_for_tick_sleeps_until_deadline() {
    let mut pacer = TickScheduler::with_rate(TickConfig::MAX_TICK_RATE_HZ);

    let first = pacer.wait_for_tick().expect("first tick");
    let due = pacer.next_tick().expect("deadline after first tick");
    let second = pacer.wait_for_tick().expect("second tick");

    assert_eq!(first.tick, 1);
    assert_eq!(second.tick, 2);
    assert!(Instant::now() >= due);
}
