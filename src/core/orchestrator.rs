//! Drives a network through a run: conditions, trial-blocks, trials, alpha
//! ticks, quarters and cycles, reporting every boundary to the [`Stepper`].
//!
//! The loop is resumable. When the stepper answers "return" the orchestrator
//! keeps every cursor, and the next [`Orchestrator::run`] call continues from
//! the exact cycle it left. Boundaries that fall on the same cycle are queued
//! finest first and reported one at a time, so each is seen exactly once even
//! when a pause lands between two of them.

use std::collections::VecDeque;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::codes::CodeError;
use crate::counters::Counters;
use crate::generator::{expand_trial_block, TrialInstance, TrialInstanceGenerator};
use crate::network::{Network, NetworkError};
use crate::observer::{OrchestratorAdapter, ScheduleSnapshot};
use crate::prng::Prng;
use crate::schedule::{Catalog, Condition};
use crate::stepper::{Granularity, RunState, Stepper};
use crate::unroller::{AlphaRow, AlphaTrialUnroller, UnrollOptions};

pub const QUARTERS: usize = 4;
/// The quarter whose end carries the outcome; weight updates follow it.
pub const PLUS_QUARTER: usize = 3;
/// Quarters that make up the minus (expectation) phase.
const MINUS_QUARTERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OrchestratorConfig {
    pub cycles_per_quarter: usize,
    /// When false no weight updates are requested at all.
    pub training: bool,
    /// Seed for trial expansion; `None` uses a fixed default.
    pub seed: Option<u64>,
    pub emit_mixed_expectation: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cycles_per_quarter: 25,
            training: true,
            seed: None,
            emit_mixed_expectation: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every condition of the run finished. The stepper is left `Stopped`.
    Completed,
    Paused,
    Stopped,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown run {0:?}")]
    UnknownRun(String),
    #[error("unknown condition {0:?}")]
    UnknownCondition(String),
    #[error("network failure: {0}")]
    Network(#[from] NetworkError),
    #[error("input encoding failed: {0}")]
    Code(#[from] CodeError),
}

pub type ScheduleObserver = Box<dyn FnMut(&ScheduleSnapshot) + Send>;

/// Where inside the current alpha tick we are.
#[derive(Debug, Clone, Copy, Default)]
struct TickCursor {
    quarter: usize,
    cycle: usize,
    input_applied: bool,
}

pub struct Orchestrator {
    catalog: Arc<Catalog>,
    run_name: String,
    conditions: Vec<String>,
    cfg: OrchestratorConfig,
    stepper: Arc<Stepper>,
    rng: Prng,

    counters: Counters,
    condition: Option<Condition>,
    trials: Option<TrialInstanceGenerator>,
    trial: Option<TrialInstance>,
    unroller: AlphaTrialUnroller,
    cursor: TickCursor,
    pending: VecDeque<Granularity>,

    observer: Option<ScheduleObserver>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<Catalog>,
        run_name: &str,
        cfg: OrchestratorConfig,
        stepper: Arc<Stepper>,
    ) -> Result<Self, OrchestratorError> {
        let run = catalog
            .run(run_name)
            .ok_or_else(|| OrchestratorError::UnknownRun(run_name.to_string()))?;
        let conditions: Vec<String> = run.conditions().map(str::to_string).collect();
        let cfg = OrchestratorConfig {
            cycles_per_quarter: cfg.cycles_per_quarter.max(1),
            ..cfg
        };

        Ok(Self {
            counters: Counters::new(conditions.len()),
            rng: Prng::new(cfg.seed.unwrap_or(1)),
            catalog,
            run_name: run_name.to_string(),
            conditions,
            cfg,
            stepper,
            condition: None,
            trials: None,
            trial: None,
            unroller: AlphaTrialUnroller::new(),
            cursor: TickCursor::default(),
            pending: VecDeque::new(),
            observer: None,
        })
    }

    /// Rewind to the first cycle of the run with a freshly seeded generator.
    pub fn restart(&mut self) {
        self.rng = Prng::new(self.cfg.seed.unwrap_or(1));
        self.counters = Counters::new(self.conditions.len());
        self.condition = None;
        self.trials = None;
        self.trial = None;
        self.unroller.clear();
        self.cursor = TickCursor::default();
        self.pending.clear();
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.cfg
    }

    pub fn stepper(&self) -> &Arc<Stepper> {
        &self.stepper
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn current_condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    pub fn current_trial(&self) -> Option<&TrialInstance> {
        self.trial.as_ref()
    }

    /// Trials of the current trial-block, in presentation order.
    pub fn block_trials(&self) -> &[TrialInstance] {
        self.trials.as_ref().map_or(&[], |g| g.trials())
    }

    /// Input rows of the most recently started trial.
    pub fn rows(&self) -> &[AlphaRow] {
        self.unroller.rows()
    }

    pub fn is_complete(&self) -> bool {
        self.counters.condition.is_done()
    }

    /// Receive a snapshot after every completed alpha tick.
    pub fn set_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&ScheduleSnapshot) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        OrchestratorAdapter::new(self).snapshot()
    }

    /// Advance until the run completes or the stepper says return.
    pub fn run<N: Network + ?Sized>(&mut self, net: &mut N) -> Result<RunOutcome, OrchestratorError> {
        match self.stepper.state() {
            RunState::Running => {}
            RunState::Paused => return Ok(RunOutcome::Paused),
            RunState::Stopped => return Ok(RunOutcome::Stopped),
        }

        loop {
            if let Some(outcome) = self.flush_boundaries() {
                return Ok(outcome);
            }
            if self.is_complete() {
                info!(run = %self.run_name, "run complete");
                if let Err(e) = self.stepper.stop() {
                    warn!("could not stop stepper after completion: {e}");
                }
                return Ok(RunOutcome::Completed);
            }
            if let Err(e) = self.advance_cycle(net) {
                error!(run = %self.run_name, counters = ?self.counters, "run aborted: {e}");
                if let Err(e) = self.stepper.stop() {
                    warn!("could not stop stepper after failure: {e}");
                }
                return Err(e);
            }
        }
    }

    /// Run to completion or stop, blocking through pauses.
    pub fn drive<N: Network + ?Sized>(&mut self, net: &mut N) -> Result<RunOutcome, OrchestratorError> {
        loop {
            match self.run(net)? {
                RunOutcome::Paused => {
                    if self.stepper.wait_while_paused() == RunState::Stopped {
                        return Ok(RunOutcome::Stopped);
                    }
                }
                done => return Ok(done),
            }
        }
    }

    fn flush_boundaries(&mut self) -> Option<RunOutcome> {
        while let Some(grain) = self.pending.pop_front() {
            if self.stepper.step_point(grain) {
                return Some(match self.stepper.state() {
                    RunState::Paused => RunOutcome::Paused,
                    _ => RunOutcome::Stopped,
                });
            }
        }
        None
    }

    fn advance_cycle<N: Network + ?Sized>(&mut self, net: &mut N) -> Result<(), OrchestratorError> {
        self.ensure_trial()?;

        if !self.cursor.input_applied {
            if let Some(row) = self.unroller.row(self.counters.alpha_tick.cur) {
                for (layer, code) in row.layers() {
                    net.apply_external_input(layer, code)?;
                }
            }
            self.cursor.input_applied = true;
        }

        net.run_one_cycle()?;
        self.cursor.cycle += 1;
        self.pending.push_back(Granularity::Cycle);
        if self.cursor.cycle < self.cfg.cycles_per_quarter {
            return Ok(());
        }

        let quarter = self.cursor.quarter;
        net.finalize_quarter(quarter)?;
        let test_only = self.trial.as_ref().is_some_and(|t| t.test_only);
        if quarter == PLUS_QUARTER && self.cfg.training && !test_only {
            net.compute_and_apply_weight_updates()?;
        }
        self.cursor.cycle = 0;
        self.cursor.quarter += 1;
        self.pending.push_back(Granularity::Quarter);
        if self.cursor.quarter == MINUS_QUARTERS {
            self.pending.push_back(Granularity::MinusPhase);
        }
        if self.cursor.quarter == QUARTERS {
            self.cursor = TickCursor::default();
            self.complete_tick(net)?;
        }
        Ok(())
    }

    /// Lazily open the condition, trial-block and trial the counters point at.
    fn ensure_trial(&mut self) -> Result<(), OrchestratorError> {
        if self.condition.is_none() {
            let name = &self.conditions[self.counters.condition.cur];
            let cond = self
                .catalog
                .condition(name)
                .cloned()
                .ok_or_else(|| OrchestratorError::UnknownCondition(name.clone()))?;
            info!(
                run = %self.run_name,
                condition = %cond.name,
                n_iters = cond.n_iters,
                blocks_per_iter = cond.blocks_per_iter,
                "condition started"
            );
            self.counters.trial_block.reset(cond.n_iters);
            self.condition = Some(cond);
        }

        if self.trials.is_none() {
            if let Some(cond) = self.condition.as_ref() {
                let templates = self.catalog.templates_for(cond);
                let expansion = expand_trial_block(cond, templates, &mut self.rng);
                for name in &expansion.degenerate_omissions {
                    warn!(
                        condition = %cond.name,
                        trial = %name,
                        "omission count rounds to all-or-nothing"
                    );
                }
                debug!(
                    condition = %cond.name,
                    block = self.counters.trial_block.cur,
                    trials = expansion.trials.len(),
                    "trial block expanded"
                );
                self.counters.trial.reset(expansion.trials.len());
                self.trials = Some(TrialInstanceGenerator::new(expansion.trials));
            }
        }

        if self.trial.is_none() {
            let context_mode = self
                .condition
                .as_ref()
                .map(|c| c.context_mode)
                .unwrap_or_default();
            if let Some(gen) = self.trials.as_mut() {
                let trial = gen.next_trial().clone();
                debug!(trial = %trial.trial_name, left = gen.remaining(), "trial started");
                let opts = UnrollOptions {
                    context_mode,
                    emit_mixed_expectation: self.cfg.emit_mixed_expectation,
                };
                self.unroller.unroll(&trial, opts)?;
                self.counters.alpha_tick.reset(trial.alpha_ticks);
                self.trial = Some(trial);
            }
        }
        Ok(())
    }

    fn complete_tick<N: Network + ?Sized>(&mut self, net: &mut N) -> Result<(), OrchestratorError> {
        let tick = self.counters.alpha_tick.cur;
        let roll = self.counters.advance_tick();
        self.pending.push_back(Granularity::AlphaCycle);
        self.notify_observer(tick);

        if roll.trial {
            self.trial = None;
            self.pending.push_back(Granularity::Trial);
        }
        if roll.trial_block {
            self.trials = None;
            self.save_weights_if_due(net, roll.condition)?;
            self.pending.push_back(Granularity::TrialBlock);
        }
        if roll.condition {
            if let Some(cond) = self.condition.take() {
                info!(run = %self.run_name, condition = %cond.name, "condition finished");
            }
            self.pending.push_back(Granularity::Condition);
        }
        Ok(())
    }

    fn save_weights_if_due<N: Network + ?Sized>(
        &mut self,
        net: &mut N,
        condition_done: bool,
    ) -> Result<(), OrchestratorError> {
        let Some(cond) = self.condition.as_ref() else {
            return Ok(());
        };
        if cond.save_wts_interval == 0 {
            return Ok(());
        }
        let completed = if condition_done {
            cond.n_iters
        } else {
            self.counters.trial_block.cur
        };
        if completed % cond.save_wts_interval == 0 {
            let label = format!("{}_{}_blk{}", self.run_name, cond.name, completed);
            debug!(%label, "saving weights");
            net.save_weights(&label)?;
        }
        Ok(())
    }

    fn notify_observer(&mut self, tick: usize) {
        if let Some(mut observer) = self.observer.take() {
            let snap = OrchestratorAdapter::new(self).with_tick(tick).snapshot();
            observer(&snap);
            self.observer = Some(observer);
        }
    }
}
