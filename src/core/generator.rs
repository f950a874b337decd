//! Expansion of one condition's weighted templates into the concrete trials
//! of a single trial-block.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::codes::Valence;
use crate::prng::Prng;
use crate::schedule::{Condition, TrialBlockTemplate};

/// Marks a template that is never reinforced, whatever its `us_prob`.
pub const NO_REINFORCEMENT_MARKER: &str = "_NR";
pub const REINFORCED_SUFFIX: &str = "_Rf";
pub const OMIT_SUFFIX: &str = "_omit";

/// One concrete trial of a trial-block.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrialInstance {
    pub trial_name: String,
    pub template_name: String,
    pub cs: String,
    pub context: String,
    pub valence: Valence,
    pub us_index: usize,
    pub us_magnitude: f32,
    /// The US is delivered on this trial.
    pub us_present: bool,
    /// The US was expected with some probability but withheld.
    pub us_omitted: bool,
    pub alpha_ticks: usize,
    pub cs_time_start: usize,
    pub cs_time_end: usize,
    pub cs2_time_start: usize,
    pub cs2_time_end: usize,
    pub us_time_start: usize,
    pub us_time_end: usize,
    pub mixed_us: bool,
    pub test_only: bool,
}

impl TrialInstance {
    fn from_template(t: &TrialBlockTemplate, trial_name: String, us_present: bool, us_omitted: bool) -> Self {
        Self {
            trial_name,
            template_name: t.trial_name.clone(),
            cs: t.cs.clone(),
            context: t.context.clone(),
            valence: t.valence,
            us_index: t.us_index,
            us_magnitude: t.us_magnitude,
            us_present,
            us_omitted,
            alpha_ticks: t.alpha_ticks,
            cs_time_start: t.cs_time_start,
            cs_time_end: t.cs_time_end,
            cs2_time_start: t.cs2_time_start,
            cs2_time_end: t.cs2_time_end,
            us_time_start: t.us_time_start,
            us_time_end: t.us_time_end,
            mixed_us: t.mixed_us,
            test_only: t.test_only,
        }
    }
}

/// `PercentOfTotal` rescaled to sum to one. All-zero input stays all-zero.
pub fn normalized_percents(templates: &[TrialBlockTemplate]) -> Vec<f64> {
    let total: f64 = templates.iter().map(|t| t.percent_of_total.max(0.0)).sum();
    templates
        .iter()
        .map(|t| {
            if total > 0.0 {
                t.percent_of_total.max(0.0) / total
            } else {
                0.0
            }
        })
        .collect()
}

/// Per-template repeat counts before the quota truncation.
///
/// Every template with positive weight appears at least once; the last
/// weighted template absorbs any shortfall so the counts reach `quota`.
pub fn repeat_counts(normalized: &[f64], quota: usize) -> Vec<usize> {
    let mut counts: Vec<usize> = normalized
        .iter()
        .map(|&p| {
            if p > 0.0 {
                ((p * quota as f64).round() as usize).max(1)
            } else {
                0
            }
        })
        .collect();

    let running: usize = counts.iter().sum();
    if running < quota {
        if let Some(last) = normalized.iter().rposition(|&p| p > 0.0) {
            counts[last] += quota - running;
        }
    }
    counts
}

/// Number of omissions for one template in exact-proportion mode.
///
/// Rounds `quota × p × (1 − us_prob)`; small quotas can round to zero or
/// to the whole repeat count.
pub fn exact_omissions(quota: usize, normalized: f64, us_prob: f64, repeats: usize) -> usize {
    let n = (quota as f64 * normalized * (1.0 - us_prob)).round();
    (n.max(0.0) as usize).min(repeats)
}

fn with_suffix(name: &str, suffix: &str) -> String {
    if name.contains(suffix) {
        name.to_string()
    } else {
        format!("{}{}", name, suffix)
    }
}

/// Outcome of expanding one trial-block.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub trials: Vec<TrialInstance>,
    /// Templates whose exact omission count collapsed to none or all of
    /// their repeats despite a fractional `us_prob`.
    pub degenerate_omissions: Vec<String>,
}

/// Expand `templates` for one trial-block of `condition`.
pub fn expand_trial_block(
    condition: &Condition,
    templates: &[TrialBlockTemplate],
    rng: &mut Prng,
) -> Expansion {
    let quota = condition.blocks_per_iter;
    let normalized = normalized_percents(templates);
    let counts = repeat_counts(&normalized, quota);

    let mut out = Expansion {
        trials: Vec::with_capacity(quota),
        degenerate_omissions: Vec::new(),
    };

    'templates: for ((t, &p), &repeats) in templates.iter().zip(&normalized).zip(&counts) {
        if repeats == 0 {
            continue;
        }

        let never = t.trial_name.contains(NO_REINFORCEMENT_MARKER) || t.us_prob <= 0.0;
        let always = !never && t.us_prob >= 1.0;

        let n_omit = if !never && !always && condition.fixed_prob {
            let n = exact_omissions(quota, p, t.us_prob, repeats);
            if n == 0 || n == repeats {
                out.degenerate_omissions.push(t.trial_name.clone());
            }
            n
        } else {
            0
        };

        for j in 0..repeats {
            if out.trials.len() >= quota {
                break 'templates;
            }
            let trial = if never {
                let name = with_suffix(&t.trial_name, NO_REINFORCEMENT_MARKER);
                TrialInstance::from_template(t, name, false, false)
            } else if always {
                let name = with_suffix(&t.trial_name, REINFORCED_SUFFIX);
                TrialInstance::from_template(t, name, true, false)
            } else {
                let omit = if condition.fixed_prob {
                    j < n_omit
                } else {
                    rng.next_f64_01() > t.us_prob
                };
                let suffix = if omit { OMIT_SUFFIX } else { REINFORCED_SUFFIX };
                TrialInstance::from_template(t, with_suffix(&t.trial_name, suffix), !omit, omit)
            };
            out.trials.push(trial);
        }
    }

    if condition.permute {
        rng.shuffle(&mut out.trials);
    }
    out
}

/// The trials of the current trial-block, consumed front to back.
#[derive(Debug, Clone, Default)]
pub struct TrialInstanceGenerator {
    trials: Vec<TrialInstance>,
    next: usize,
}

impl TrialInstanceGenerator {
    pub fn new(trials: Vec<TrialInstance>) -> Self {
        Self { trials, next: 0 }
    }

    /// Trials not yet handed out.
    pub fn remaining(&self) -> usize {
        self.trials.len() - self.next
    }

    pub fn trials(&self) -> &[TrialInstance] {
        &self.trials
    }

    /// Hand out the next trial.
    ///
    /// # Panics
    ///
    /// Reading past the end means the trial counter and the generated list
    /// have desynchronized; there is no way to continue the schedule.
    pub fn next_trial(&mut self) -> &TrialInstance {
        let idx = self.next;
        if idx >= self.trials.len() {
            panic!(
                "trial generator exhausted: requested trial {} of a {}-trial block",
                idx + 1,
                self.trials.len()
            );
        }
        self.next += 1;
        &self.trials[idx]
    }
}
