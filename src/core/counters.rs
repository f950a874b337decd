#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A bounded position: `cur` counts completed units out of `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Counter {
    pub cur: usize,
    pub max: usize,
}

impl Counter {
    pub fn new(max: usize) -> Self {
        Self { cur: 0, max }
    }

    pub fn is_done(&self) -> bool {
        self.cur >= self.max
    }

    pub fn reset(&mut self, max: usize) {
        self.cur = 0;
        self.max = max;
    }

    /// Advance by one. Returns `true` when this completes the counter, in
    /// which case it is left at zero so the caller can roll the next level.
    pub fn incr(&mut self) -> bool {
        self.cur += 1;
        if self.cur >= self.max {
            self.cur = 0;
            true
        } else {
            false
        }
    }
}

/// The four nested schedule positions, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Counters {
    pub condition: Counter,
    pub trial_block: Counter,
    pub trial: Counter,
    pub alpha_tick: Counter,
}

/// Which levels an [`Counters::advance_tick`] call completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rollover {
    pub trial: bool,
    pub trial_block: bool,
    pub condition: bool,
    pub run: bool,
}

impl Counters {
    pub fn new(conditions: usize) -> Self {
        Self {
            condition: Counter::new(conditions),
            ..Default::default()
        }
    }

    /// Count one finished alpha tick, rolling completed inner levels into the
    /// next one up. Inner maxima are left for the caller to set when the
    /// next unit at that level begins.
    pub fn advance_tick(&mut self) -> Rollover {
        let mut r = Rollover::default();
        if !self.alpha_tick.incr() {
            return r;
        }
        r.trial = true;
        if !self.trial.incr() {
            return r;
        }
        r.trial_block = true;
        if !self.trial_block.incr() {
            return r;
        }
        r.condition = true;
        // The run counter is the outermost; it stays at max once complete.
        self.condition.cur += 1;
        r.run = self.condition.is_done();
        r
    }
}
