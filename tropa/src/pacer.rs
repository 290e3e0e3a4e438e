//! Start-time pacing for arrival-rate executors.
//!
//! A [`RateSchedule`] describes a piecewise-linear rate of iteration starts. Instead
//! of handing out tokens on every tick, the [`Pacer`] computes the exact instant at
//! which the n-th iteration is due: slot `n` sits where the integral of the rate
//! reaches `n`. Over a linear segment starting at rate `a` and ending at rate `b` over
//! `D` seconds, the integral after `t` seconds is
//!
//! ```text
//! I(t) = a·t + k·t²      with k = (b - a) / (2·D)
//! ```
//!
//! so the offset of the `m`-th slot inside the segment is the positive root of
//! `k·t² + a·t - m = 0`, written in the cancellation-free form
//!
//! ```text
//! t = 2m / (a + sqrt(a² + 4·k·m))
//! ```
//!
//! which degrades gracefully to `t = m / a` for a flat segment.

use std::time::Duration;

use crate::config::Stage;

#[cfg(feature = "internals")]
pub use internals::*;
use internals::*;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    stage: usize,
    start: Duration,
    duration: Duration,
    /// Rates in iterations per second.
    from: f64,
    to: f64,
    /// Slots due before the segment starts.
    before: f64,
}

impl Segment {
    fn integral(&self) -> f64 {
        (self.from + self.to) / 2.0 * self.duration.as_secs_f64()
    }

    fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Piecewise-linear rate of iteration starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSchedule {
    segments: Vec<Segment>,
    total: Duration,
    total_iterations: f64,
    /// Counted in whole nanoseconds so float error never adds a slot.
    total_slots: u64,
}

impl RateSchedule {
    /// Ramp from `start_rate` through `stages`. Rates are iterations per `time_unit`.
    ///
    /// A zero-duration stage jumps straight to its target.
    pub fn new(start_rate: u64, stages: &[Stage], time_unit: Duration) -> Self {
        let per_sec = |r: u64| r as f64 / time_unit.as_secs_f64();
        let mut segments = Vec::with_capacity(stages.len());
        let mut rate = per_sec(start_rate);
        let mut start = Duration::ZERO;
        let mut before = 0.0;
        // Iterations times 2·time_unit, in nanoseconds
        let mut scaled = 0u128;
        let mut from = start_rate;

        for (i, stage) in stages.iter().enumerate() {
            scaled += (u128::from(from) + u128::from(stage.target)) * stage.duration.as_nanos();
            from = stage.target;
            let seg = Segment {
                stage: i,
                start,
                duration: stage.duration,
                from: rate,
                to: per_sec(stage.target),
                before,
            };
            before += seg.integral();
            start = seg.end();
            rate = seg.to;
            segments.push(seg);
        }

        let total_slots = scaled.div_ceil(2 * time_unit.as_nanos().max(1));
        Self {
            segments,
            total: start,
            total_iterations: before,
            total_slots: u64::try_from(total_slots).unwrap_or(u64::MAX),
        }
    }

    /// `rate` iterations per `time_unit`, held for `duration`.
    pub fn constant(rate: u64, time_unit: Duration, duration: Duration) -> Self {
        Self::new(rate, &[Stage::new(duration, rate)], time_unit)
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Number of iterations the whole schedule starts.
    pub fn total_slots(&self) -> u64 {
        self.total_slots
    }

    fn segment_at(&self, elapsed: Duration) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| !s.duration.is_zero() && elapsed < s.end())
    }

    /// Index of the stage running at `elapsed`, `None` once the schedule is over.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        self.segment_at(elapsed).map(|s| s.stage)
    }

    /// Instantaneous rate at `elapsed`, in iterations per second.
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        match self.segment_at(elapsed) {
            Some(s) => {
                let t = (elapsed - s.start).as_secs_f64() / s.duration.as_secs_f64();
                lerp(s.from, s.to, t)
            }
            None => 0.0,
        }
    }

    /// Iterations due in `[0, elapsed)`, as the exact integral of the rate.
    pub fn iterations_by(&self, elapsed: Duration) -> f64 {
        match self.segment_at(elapsed) {
            Some(s) => {
                let t = (elapsed - s.start).as_secs_f64();
                s.before + segment_integral(s.from, s.to, s.duration.as_secs_f64(), t)
            }
            None => self.total_iterations,
        }
    }

    /// Start offset of slot `n`, `None` if the schedule ends first. Offsets always
    /// fall strictly before the end of the schedule.
    pub fn time_of(&self, n: u64) -> Option<Duration> {
        if n >= self.total_slots {
            return None;
        }
        let n = n as f64;
        let seg = self
            .segments
            .iter()
            .find(|s| s.integral() > 0.0 && n < s.before + s.integral())?;
        let secs = slot_offset(seg.from, seg.to, seg.duration.as_secs_f64(), n - seg.before);
        // Rounding must never push a slot past its own segment or the schedule
        let last = self.total.saturating_sub(Duration::from_nanos(1));
        Some((seg.start + Duration::from_secs_f64(secs)).min(seg.end()).min(last))
    }
}

/// A start instant handed out by the [`Pacer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Offset from the executor's start.
    pub offset: Duration,
    /// Slot number within the schedule.
    pub index: u64,
    /// Slots skipped right before this one because they were too far behind.
    pub skipped: u64,
}

/// Hands out the start offsets of a [`RateSchedule`] in order.
#[derive(Debug, Clone)]
pub struct Pacer {
    schedule: RateSchedule,
    next: u64,
    max_lag: Duration,
    skipped: u64,
}

impl Pacer {
    pub fn new(schedule: RateSchedule, max_lag: Duration) -> Self {
        Self {
            schedule,
            next: 0,
            max_lag,
            skipped: 0,
        }
    }

    pub fn schedule(&self) -> &RateSchedule {
        &self.schedule
    }

    /// Slots skipped so far, including any skipped at the very end of the schedule
    /// that no returned [`Slot`] reported.
    pub fn skipped_total(&self) -> u64 {
        self.skipped
    }

    /// Next slot given that `elapsed` has passed since the executor started.
    ///
    /// Slots already more than `max_lag` in the past are skipped instead of being
    /// started in a burst.
    pub fn next_slot(&mut self, elapsed: Duration) -> Option<Slot> {
        let total = self.schedule.total_slots();
        if self.next >= total {
            return None;
        }
        let mut offset = self.schedule.time_of(self.next)?;
        let mut skipped = 0;

        if elapsed > offset + self.max_lag {
            let horizon = elapsed - self.max_lag;
            let first_kept = (self.schedule.iterations_by(horizon).ceil() as u64)
                .max(self.next + 1)
                .min(total);
            skipped = first_kept - self.next;
            self.skipped += skipped;
            self.next = first_kept;
            offset = self.schedule.time_of(self.next)?;
        }

        let slot = Slot {
            offset,
            index: self.next,
            skipped,
        };
        self.next += 1;
        Some(slot)
    }
}

/// Watches started iterations against the schedule and flags a sustained shortfall.
#[derive(Debug, Clone)]
pub struct RateMonitor {
    tolerance: f64,
    grace: Duration,
    behind_since: Option<Duration>,
    fired: bool,
}

/// Shortfalls smaller than this are scheduling noise.
const MIN_SHORTFALL: f64 = 2.0;

impl RateMonitor {
    pub fn new(tolerance: f64, grace: Duration) -> Self {
        Self {
            tolerance,
            grace,
            behind_since: None,
            fired: false,
        }
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    /// Feed one observation. Returns `true` exactly once: the first time the
    /// shortfall has lasted longer than the grace period.
    pub fn observe(&mut self, elapsed: Duration, expected: f64, started: u64) -> bool {
        let started = started as f64;
        let behind =
            expected - started >= MIN_SHORTFALL && started < expected * (1.0 - self.tolerance);
        if !behind {
            self.behind_since = None;
            return false;
        }
        let since = *self.behind_since.get_or_insert(elapsed);
        if !self.fired && elapsed.saturating_sub(since) > self.grace {
            self.fired = true;
            return true;
        }
        false
    }
}

pub(crate) mod internals {
    /// Linear interpolation between `from` and `to`, `t` clamped to `[0, 1]`.
    pub fn lerp(from: f64, to: f64, t: f64) -> f64 {
        from + (to - from) * t.clamp(0.0, 1.0)
    }

    /// Integral of a linear ramp from `from` to `to` over `duration` seconds,
    /// evaluated after `t` seconds.
    pub fn segment_integral(from: f64, to: f64, duration: f64, t: f64) -> f64 {
        let k = (to - from) / (2.0 * duration);
        from * t + k * t * t
    }

    /// Seconds into a linear ramp at which its integral reaches `m`.
    pub fn slot_offset(from: f64, to: f64, duration: f64, m: f64) -> f64 {
        if m <= 0.0 {
            return 0.0;
        }
        let k = (to - from) / (2.0 * duration);
        let disc = (from * from + 4.0 * k * m).max(0.0);
        2.0 * m / (from + disc.sqrt())
    }
}
