//! Fixed-tick simulation clock with a bounded per-frame delta.
//!
//! Each frame the caller hands the clock the current time and gets back
//! how many fixed ticks to run. The driving loop then, per tick, merges
//! pending rewind records, steps the simulation and polls the transport.
//!
//! A stalled host is capped to three ticks of catch-up work per frame,
//! slowing the shown time instead. During network play the cap is off:
//! clamping there would silently desynchronize the server and client
//! clocks.

use std::time::{Duration, Instant};

use log::trace;

use crate::types::Tick;

/// Most fixed steps a single frame may simulate when not networked.
const MAX_FRAME_TICKS: u32 = 3;

/// Fraction of each frame delta usable for clock-skew correction, small
/// enough that the player does not notice.
const ADJUST_DIVISOR: i64 = 10;

#[derive(Clone, Debug)]
pub struct ClockConfig {
    /// Duration of one fixed simulation step.
    pub tick_duration: Duration,
    /// Networked sessions must never clamp the frame delta.
    pub networked: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            // 60 fixed steps per second.
            tick_duration: Duration::from_nanos(16_666_667),
            networked: false,
        }
    }
}

/// Converts wall-clock frames into a monotonic fixed tick count.
pub struct SimulationClock {
    config: ClockConfig,
    last_frame: Option<Instant>,
    /// Unconsumed time carried between frames, in nanoseconds.
    accumulator: u64,
    current_tick: Tick,
    /// Remaining server-requested skew correction, in nanoseconds.
    /// Positive slows this client down, negative speeds it up.
    adjust_by: i64,
}

impl SimulationClock {
    pub fn new(config: ClockConfig) -> Self {
        Self {
            config,
            last_frame: None,
            accumulator: 0,
            current_tick: 0,
            adjust_by: 0,
        }
    }

    /// Consumes the time since the previous frame and returns how many
    /// fixed ticks to simulate now. The first call only establishes the
    /// baseline and yields zero ticks.
    pub fn advance(&mut self, now: Instant) -> u32 {
        let Some(last) = self.last_frame.replace(now) else {
            return 0;
        };
        let mut delta = now.saturating_duration_since(last);

        if !self.config.networked {
            let cap = self.config.tick_duration * MAX_FRAME_TICKS;
            if delta > cap {
                delta = cap;
            }
        } else if self.adjust_by != 0 {
            delta = self.apply_adjustment(delta);
        }

        self.accumulator += delta.as_nanos() as u64;
        let tick_nanos = self.config.tick_duration.as_nanos() as u64;
        let steps = self.accumulator / tick_nanos;
        self.accumulator -= steps * tick_nanos;
        let steps = steps.min(u32::MAX as u64) as u32;
        self.current_tick += steps;
        steps
    }

    /// Spreads a server-requested clock correction over the following
    /// frames rather than jumping in one step, to minimize rewinds.
    pub fn request_adjustment(&mut self, amount: Duration, slow_down: bool) {
        let nanos = amount.as_nanos().min(i64::MAX as u128) as i64;
        self.adjust_by += if slow_down { nanos } else { -nanos };
    }

    fn apply_adjustment(&mut self, delta: Duration) -> Duration {
        let delta_nanos = delta.as_nanos().min(i64::MAX as u128) as i64;
        let step = delta_nanos / ADJUST_DIVISOR;
        let applied = if self.adjust_by >= 0 {
            step.min(self.adjust_by)
        } else {
            (-step).max(self.adjust_by)
        };
        self.adjust_by -= applied;
        trace!(
            "adjusting frame delta by {}ns, {}ns outstanding",
            applied,
            self.adjust_by
        );
        Duration::from_nanos((delta_nanos - applied).max(0) as u64)
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    pub fn tick_duration(&self) -> Duration {
        self.config.tick_duration
    }

    /// Outstanding skew correction still to be applied.
    pub fn pending_adjustment(&self) -> Duration {
        Duration::from_nanos(self.adjust_by.unsigned_abs())
    }

    pub fn reset(&mut self) {
        self.last_frame = None;
        self.accumulator = 0;
        self.current_tick = 0;
        self.adjust_by = 0;
    }
}
