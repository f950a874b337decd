//! Per-tick input rows for one trial.
//!
//! A trial of `alpha_ticks` ticks becomes `alpha_ticks` immutable rows. The
//! table is owned by the unroller and rebuilt from scratch for every trial;
//! capacity is kept, contents never carry over.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::codes::{
    pv_index, us_time_index, CodeError, ContextCode, ContextMode, SparseCode, StimulusCode,
    CONTEXT_DIM, PV_DIM, STIM_DIM, US_TIME_DIM,
};
use crate::generator::TrialInstance;

pub const STIM_LAYER: &str = "StimIn";
pub const CONTEXT_LAYER: &str = "ContextIn";
pub const PV_LAYER: &str = "USIn";
pub const US_TIME_LAYER: &str = "USTimeIn";

/// Activation used for the competing-valence expectation on mixed trials.
const MIXED_EXPECTATION: f32 = 0.5;

/// Inputs for a single tick.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AlphaRow {
    pub tick: usize,
    pub stimulus: SparseCode,
    pub context: SparseCode,
    pub pv: SparseCode,
    pub us_time: SparseCode,
}

impl AlphaRow {
    fn empty(tick: usize) -> Self {
        Self {
            tick,
            stimulus: SparseCode::new(STIM_DIM),
            context: SparseCode::new(CONTEXT_DIM),
            pv: SparseCode::new(PV_DIM),
            us_time: SparseCode::new(US_TIME_DIM),
        }
    }

    /// Layer name and code pairs, in the order they are applied.
    pub fn layers(&self) -> [(&'static str, &SparseCode); 4] {
        [
            (STIM_LAYER, &self.stimulus),
            (CONTEXT_LAYER, &self.context),
            (PV_LAYER, &self.pv),
            (US_TIME_LAYER, &self.us_time),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UnrollOptions {
    pub context_mode: ContextMode,
    /// Emit the wrong-valence timing code on mixed-US trials.
    pub emit_mixed_expectation: bool,
}

impl Default for UnrollOptions {
    fn default() -> Self {
        Self {
            context_mode: ContextMode::Elemental,
            emit_mixed_expectation: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlphaTrialUnroller {
    table: Vec<AlphaRow>,
}

impl AlphaTrialUnroller {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently unrolled table.
    pub fn rows(&self) -> &[AlphaRow] {
        &self.table
    }

    pub fn row(&self, tick: usize) -> Option<&AlphaRow> {
        self.table.get(tick)
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Rebuild the table for `trial`. On error the table is left empty.
    pub fn unroll(&mut self, trial: &TrialInstance, opts: UnrollOptions) -> Result<&[AlphaRow], CodeError> {
        self.table.clear();
        let rows = build_rows(trial, opts)?;
        self.table.extend(rows);
        Ok(&self.table)
    }
}

fn in_window(t: usize, start: usize, end: usize) -> bool {
    start <= t && t <= end
}

fn build_rows(trial: &TrialInstance, opts: UnrollOptions) -> Result<Vec<AlphaRow>, CodeError> {
    let cs = StimulusCode::parse(&trial.cs)?;
    let ctx = ContextCode::parse(&trial.context)?.active_indices(opts.context_mode);
    let pv = pv_index(trial.valence, trial.us_index)?;

    let mut rows = Vec::with_capacity(trial.alpha_ticks);
    for t in 0..trial.alpha_ticks {
        let mut row = AlphaRow::empty(t);

        if in_window(t, trial.cs_time_start, trial.cs_time_end) {
            row.stimulus.set(cs.first, 1.0);
        }
        if let Some(second) = cs.second {
            if in_window(t, trial.cs2_time_start, trial.cs2_time_end) {
                row.stimulus.set(second, 1.0);
            }
        }

        for &c in &ctx {
            row.context.set(c, 1.0);
        }

        // Time since CS onset, up to and including US onset.
        if t > trial.cs_time_start && t <= trial.us_time_start {
            let elapsed = t - trial.cs_time_start;
            row.us_time
                .set(us_time_index(trial.valence, trial.us_index, elapsed)?, 1.0);
            if trial.mixed_us && opts.emit_mixed_expectation {
                let other = us_time_index(trial.valence.opposite(), trial.us_index, elapsed)?;
                row.us_time.set(other, MIXED_EXPECTATION);
            }
        }

        if trial.us_present && in_window(t, trial.us_time_start, trial.us_time_end) {
            row.pv.set(pv, trial.us_magnitude);
        }

        rows.push(row);
    }
    Ok(rows)
}
