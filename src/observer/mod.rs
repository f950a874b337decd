use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::counters::Counters;
use crate::orchestrator::Orchestrator;
use crate::stepper::StepperSnapshot;
use crate::unroller::AlphaRow;

/// A read-only view of where a run is.
///
/// Observers cannot steer the orchestrator. Snapshots allocate (the row
/// table is cloned), so take them at tick granularity or coarser.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScheduleSnapshot {
    pub run: String,
    pub condition: Option<String>,
    pub counters: Counters,
    pub trial_name: Option<String>,
    /// Tick that just finished, when taken from the tick observer.
    pub last_tick: Option<usize>,
    pub block_trials: Vec<String>,
    pub rows: Vec<AlphaRow>,
    /// `None` when taken from inside a stepper callback.
    pub stepper: Option<StepperSnapshot>,
    pub complete: bool,
}

impl fmt::Display for ScheduleSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        write!(
            f,
            "{} cond {}/{} block {}/{} trial {}/{} tick {}/{}",
            self.run,
            c.condition.cur,
            c.condition.max,
            c.trial_block.cur,
            c.trial_block.max,
            c.trial.cur,
            c.trial.max,
            c.alpha_tick.cur,
            c.alpha_tick.max,
        )?;
        if let Some(name) = &self.condition {
            write!(f, " [{}]", name)?;
        }
        if let Some(name) = &self.trial_name {
            write!(f, " {}", name)?;
        }
        if self.complete {
            f.write_str(" (complete)")?;
        }
        Ok(())
    }
}

pub struct OrchestratorAdapter<'a> {
    orch: &'a Orchestrator,
    tick: Option<usize>,
}

impl<'a> OrchestratorAdapter<'a> {
    pub fn new(orch: &'a Orchestrator) -> Self {
        Self { orch, tick: None }
    }

    pub fn with_tick(mut self, tick: usize) -> Self {
        self.tick = Some(tick);
        self
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        let o = self.orch;
        ScheduleSnapshot {
            run: o.run_name().to_string(),
            condition: o.current_condition().map(|c| c.name.clone()),
            counters: *o.counters(),
            trial_name: o.current_trial().map(|t| t.trial_name.clone()),
            last_tick: self.tick,
            block_trials: o.block_trials().iter().map(|t| t.trial_name.clone()).collect(),
            rows: o.rows().to_vec(),
            stepper: o.stepper().snapshot().ok(),
            complete: o.is_complete(),
        }
    }
}
