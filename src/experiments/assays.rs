use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::codes::{ContextMode, Valence};
use crate::experiments::assoc_net::AssociativeNet;
use crate::experiments::catalog::{builtin_catalog, RENEWAL_RUN};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, RunOutcome};
use crate::schedule::CatalogError;
use crate::stepper::{Granularity, Stepper, StepperError};

#[derive(Debug, Error)]
pub enum AssayError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Run(#[from] OrchestratorError),
    #[error(transparent)]
    Stepper(#[from] StepperError),
    #[error("run stopped during {0}")]
    Interrupted(&'static str),
}

/// US expectation for CS `A` at US onset, probed after each phase of an
/// ABA renewal design.
#[derive(Debug, Clone)]
pub struct RenewalReport {
    pub seed: u64,
    pub trials: usize,
    pub after_acquisition_a: f32,
    pub after_extinction_b: f32,
    pub after_extinction_a: f32,
    pub test_a: f32,
    pub weight_updates: u64,
    pub cycles: u64,
}

struct Probe {
    elapsed: usize,
}

impl Probe {
    fn response_in(&self, net: &AssociativeNet, context: &str) -> f32 {
        net.response("A", context, ContextMode::Elemental, Valence::Positive, 0, self.elapsed)
            .unwrap_or(0.0)
    }
}

/// Run one condition; the stepper is armed to pause at its end.
fn run_phase(
    phase: &'static str,
    orch: &mut Orchestrator,
    net: &mut AssociativeNet,
) -> Result<(), AssayError> {
    match orch.run(net)? {
        RunOutcome::Paused => {
            orch.stepper().resume(Granularity::Condition, 1)?;
            Ok(())
        }
        RunOutcome::Completed => Ok(()),
        RunOutcome::Stopped => Err(AssayError::Interrupted(phase)),
    }
}

/// Drive the built-in ABA renewal run, pausing after every condition to
/// probe the network.
pub fn renewal(seed: u64, cycles_per_quarter: usize) -> Result<RenewalReport, AssayError> {
    let catalog = Arc::new(builtin_catalog()?);
    let probe = catalog
        .templates("PosAcq")
        .and_then(|t| t.first())
        .map(|t| Probe {
            elapsed: t.us_time_start.saturating_sub(t.cs_time_start),
        })
        .unwrap_or(Probe { elapsed: 0 });

    let stepper = Arc::new(Stepper::new());
    let cfg = OrchestratorConfig {
        cycles_per_quarter,
        seed: Some(seed),
        ..Default::default()
    };
    let mut orch = Orchestrator::new(catalog, RENEWAL_RUN, cfg, Arc::clone(&stepper))?;
    let mut net = AssociativeNet::default();

    let trials = Arc::new(AtomicUsize::new(0));
    {
        let trials = Arc::clone(&trials);
        orch.set_observer(move |snap| {
            if snap.last_tick == Some(0) {
                trials.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    stepper.start(Granularity::Condition, 1)?;
    run_phase("acquisition", &mut orch, &mut net)?;
    let after_acquisition_a = probe.response_in(&net, "A");

    run_phase("extinction", &mut orch, &mut net)?;
    let after_extinction_b = probe.response_in(&net, "B");
    let after_extinction_a = probe.response_in(&net, "A");

    run_phase("renewal test", &mut orch, &mut net)?;
    let test_a = probe.response_in(&net, "A");

    Ok(RenewalReport {
        seed,
        trials: trials.load(Ordering::Relaxed),
        after_acquisition_a,
        after_extinction_b,
        after_extinction_a,
        test_a,
        weight_updates: net.updates(),
        cycles: net.cycles(),
    })
}

pub fn print_report(r: &RenewalReport) {
    println!("pavlov renewal assay");
    println!("seed={}", r.seed);
    println!("trials={}", r.trials);
    println!("after_acquisition_A={:.3}", r.after_acquisition_a);
    println!("after_extinction_B={:.3}", r.after_extinction_b);
    println!("after_extinction_A={:.3}", r.after_extinction_a);
    println!("renewal_test_A={:.3}", r.test_a);
    println!("weight_updates={}", r.weight_updates);
    println!("cycles={}", r.cycles);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_assay_tracks_each_phase() {
        let r = renewal(3, 5).unwrap();
        assert_eq!(r.trials, 50 + 50 + 4);
        assert!(r.after_acquisition_a > 0.5, "{r:?}");
        assert!(r.after_extinction_b < r.after_acquisition_a * 0.5, "{r:?}");
        // Probe trials never train.
        assert_eq!(r.test_a, r.after_extinction_a);
        assert_eq!(r.weight_updates, 100 * 5);
        assert_eq!(r.cycles, 104 * 5 * 4 * 5);
    }
}
