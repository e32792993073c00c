//! Fixed-rate pacer for Tether poll loops.
//!
//! Sockets and handlers in Tether never block, so the application decides
//! how often to poll them. [`TickScheduler`] hands out numbered ticks at a
//! fixed rate. A loop that falls behind does not get a burst of late
//! ticks: the missed ones are counted and the schedule restarts from the
//! late tick.
//!
//! ```ignore
//! let mut pacer = TickScheduler::with_rate(60);
//! while let Some(tick) = pacer.wait_for_tick() {
//!     server.poll()?;
//! }
//! ```
//!
//! A rate of 0 means the loop is paced by something else.
//! [`TickScheduler::wait_for_tick`] then returns `None` at once.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Pacer settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Ticks per second. 0 disables pacing.
    pub tick_rate_hz: u32,
}

impl TickConfig {
    pub const MAX_TICK_RATE_HZ: u32 = 128;

    /// About 16 ms per tick.
    pub const DEFAULT_FRAME_RATE_HZ: u32 = 60;

    pub fn with_rate(tick_rate_hz: u32) -> Self {
        Self { tick_rate_hz }
    }

    /// Caps the rate at [`Self::MAX_TICK_RATE_HZ`].
    pub fn validated(self) -> Self {
        if self.tick_rate_hz > Self::MAX_TICK_RATE_HZ {
            warn!(
                rate = self.tick_rate_hz,
                max = Self::MAX_TICK_RATE_HZ,
                "tick rate too high, capping"
            );
            return Self::with_rate(Self::MAX_TICK_RATE_HZ);
        }
        self
    }

    /// Length of one tick, `None` when pacing is disabled.
    pub fn tick_duration(&self) -> Option<Duration> {
        match self.tick_rate_hz {
            0 => None,
            hz => Some(Duration::from_secs(1) / hz),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// A fired tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickInfo {
    /// Starts at 1.
    pub tick: u64,
    /// Always one tick duration.
    pub dt: Duration,
    /// Whole ticks missed just before this one.
    pub ticks_skipped: u64,
}

/// Hands out ticks at a fixed rate.
#[derive(Debug)]
pub struct TickScheduler {
    rate_hz: u32,
    period: Option<Duration>,
    deadline: Option<Instant>,
    ticks: u64,
    skipped: u64,
}

impl TickScheduler {
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();
        debug!(rate = config.tick_rate_hz, "tick scheduler created");
        Self {
            rate_hz: config.tick_rate_hz,
            period: config.tick_duration(),
            deadline: None,
            ticks: 0,
            skipped: 0,
        }
    }

    pub fn with_rate(tick_rate_hz: u32) -> Self {
        Self::new(TickConfig::with_rate(tick_rate_hz))
    }

    /// Fires a tick if one is due at `now`.
    ///
    /// The first call always fires and starts the schedule. After that a
    /// tick is due every period. When `now` is a full period or more past
    /// the deadline, the missed ticks are reported in
    /// [`TickInfo::ticks_skipped`] and the next deadline is `now + period`.
    pub fn poll_tick_at(&mut self, now: Instant) -> Option<TickInfo> {
        let period = self.period?;

        let mut ticks_skipped = 0;
        let next = match self.deadline {
            None => now + period,
            Some(deadline) if now < deadline => return None,
            Some(deadline) => {
                let late = now - deadline;
                ticks_skipped = (late.as_nanos() / period.as_nanos()) as u64;
                if ticks_skipped == 0 {
                    deadline + period
                } else {
                    warn!(
                        tick = self.ticks + 1,
                        skipped = ticks_skipped,
                        "loop fell behind, skipping ticks"
                    );
                    now + period
                }
            }
        };
        self.deadline = Some(next);
        self.ticks += 1;
        self.skipped += ticks_skipped;
        trace!(tick = self.ticks, "tick");

        Some(TickInfo {
            tick: self.ticks,
            dt: period,
            ticks_skipped,
        })
    }

    /// [`poll_tick_at`](Self::poll_tick_at) with the current time.
    pub fn poll_tick(&mut self) -> Option<TickInfo> {
        self.poll_tick_at(Instant::now())
    }

    /// Sleeps until the next tick is due and fires it. Returns `None` at
    /// once when pacing is disabled.
    pub fn wait_for_tick(&mut self) -> Option<TickInfo> {
        loop {
            let now = Instant::now();
            if let Some(info) = self.poll_tick_at(now) {
                return Some(info);
            }
            let deadline = self.deadline?;
            thread::sleep(deadline.saturating_duration_since(now));
        }
    }

    /// When the next tick is due. `None` before the first tick or when
    /// pacing is disabled.
    pub fn next_tick(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks
    }

    /// Total ticks skipped since creation.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn tick_rate_hz(&self) -> u32 {
        self.rate_hz
    }

    pub fn tick_duration(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_event_driven(&self) -> bool {
        self.period.is_none()
    }
}
