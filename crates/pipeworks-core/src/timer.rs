//! Drift-compensated countdown shared by every periodic emitter.
//!
//! A frame rarely lands exactly on an emission boundary; the overshoot is
//! carried into the next interval (`start(drift)`) so that N emissions take
//! N intervals plus at most one frame, instead of accumulating one frame of
//! error per emission.

use serde::{Deserialize, Serialize};

use crate::fixed::{Fixed64, Millis};

/// Countdown timer in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitTimer {
    interval: Millis,
    remaining: Millis,
}

impl EmitTimer {
    /// A timer that is due immediately and then every `interval`.
    pub fn new(interval: Millis) -> Self {
        Self {
            interval,
            remaining: Fixed64::ZERO,
        }
    }

    /// A timer whose first tick is one full interval away.
    pub fn delayed(interval: Millis) -> Self {
        Self {
            interval,
            remaining: interval,
        }
    }

    pub fn interval(&self) -> Millis {
        self.interval
    }

    pub fn remaining(&self) -> Millis {
        self.remaining
    }

    /// Subtract elapsed time.
    pub fn advance(&mut self, dt: Millis) {
        self.remaining -= dt;
    }

    pub fn should_tick(&self) -> bool {
        self.remaining <= Fixed64::ZERO
    }

    /// The overshoot past the last boundary, in `[-interval, 0]`.
    ///
    /// Clamped so an emitter that sat blocked for many intervals emits once
    /// when it is unblocked rather than bursting to catch up.
    pub fn drift(&self) -> Millis {
        self.remaining.min(Fixed64::ZERO).max(-self.interval)
    }

    /// Begin the next interval, shortened by `drift` (a non-positive value).
    pub fn start(&mut self, drift: Millis) {
        let drift = drift.min(Fixed64::ZERO).max(-self.interval);
        self.remaining = self.interval + drift;
    }

    /// Begin the next interval carrying this timer's own drift.
    pub fn restart(&mut self) {
        self.start(self.drift());
    }

    /// Make the timer due now, carrying `drift` as already-elapsed overshoot.
    pub fn fire_with(&mut self, drift: Millis) {
        self.remaining = drift.min(Fixed64::ZERO).max(-self.interval);
    }

    /// Back to the start-of-simulation state: due immediately.
    pub fn reset(&mut self) {
        self.remaining = Fixed64::ZERO;
    }
}
