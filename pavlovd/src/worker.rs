//! The thread that owns the orchestrator and the network while a run is live.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use pavlov::experiments::{AssocNetConfig, AssociativeNet};
use pavlov::observer::ScheduleSnapshot;
use pavlov::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
use pavlov::schedule::Catalog;
use pavlov::stepper::{Granularity, Stepper, StepperError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("a run is still active; stop it first")]
    Busy,
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Stepper(#[from] StepperError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

pub struct Worker {
    catalog: Arc<Catalog>,
    cfg: OrchestratorConfig,
    net_cfg: AssocNetConfig,
    stepper: Arc<Stepper>,
    snapshot: watch::Sender<Option<ScheduleSnapshot>>,
    finished: watch::Sender<Option<String>>,
    current_run: Option<String>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(
        catalog: Arc<Catalog>,
        cfg: OrchestratorConfig,
        net_cfg: AssocNetConfig,
        stepper: Arc<Stepper>,
    ) -> Self {
        let (snapshot, _) = watch::channel(None);
        let (finished, _) = watch::channel(None);
        Self {
            catalog,
            cfg,
            net_cfg,
            stepper,
            snapshot,
            finished,
            current_run: None,
            handle: None,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn current_run(&self) -> Option<&str> {
        self.current_run.as_deref()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Latest snapshot published by the worker (one per alpha tick).
    pub fn snapshot(&self) -> Option<ScheduleSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// How the last run ended, once it has.
    pub fn last_outcome(&self) -> Option<String> {
        self.finished.borrow().clone()
    }

    /// Start `run` from its first cycle on a fresh network.
    pub fn launch(&mut self, run: &str, grain: Granularity, steps: u32) -> Result<(), WorkerError> {
        if self.is_alive() {
            return Err(WorkerError::Busy);
        }
        self.join();

        let mut orch = Orchestrator::new(Arc::clone(&self.catalog), run, self.cfg, Arc::clone(&self.stepper))?;
        let ticks = self.snapshot.clone();
        orch.set_observer(move |snap| {
            ticks.send_replace(Some(snap.clone()));
        });

        self.finished.send_replace(None);
        self.snapshot.send_replace(Some(orch.snapshot()));
        self.stepper.start(grain, steps)?;

        let net_cfg = self.net_cfg;
        let last = self.snapshot.clone();
        let finished = self.finished.clone();
        let spawned = thread::Builder::new()
            .name("pavlov-worker".to_string())
            .spawn(move || {
                let mut net = AssociativeNet::new(net_cfg);
                let message = match orch.drive(&mut net) {
                    Ok(outcome) => {
                        info!(run = %orch.run_name(), ?outcome, "worker finished");
                        format!("{outcome:?}")
                    }
                    Err(e) => {
                        error!(run = %orch.run_name(), "worker failed: {e}");
                        format!("Error: {e}")
                    }
                };
                last.send_replace(Some(orch.snapshot()));
                finished.send_replace(Some(message));
            });

        match spawned {
            Ok(handle) => {
                info!(run, %grain, steps, "run launched");
                self.handle = Some(handle);
                self.current_run = Some(run.to_string());
                Ok(())
            }
            Err(e) => {
                let _ = self.stepper.stop();
                Err(e.into())
            }
        }
    }

    /// Reap a finished worker thread. Blocks if it is still running.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pavlov::experiments::{builtin_catalog, RENEWAL_RUN};
    use pavlov::stepper::{RunState, StepperEvent};
    use std::time::Duration;

    fn worker() -> (Worker, Arc<Stepper>) {
        let stepper = Arc::new(Stepper::new());
        let cfg = OrchestratorConfig {
            cycles_per_quarter: 2,
            seed: Some(5),
            ..Default::default()
        };
        let w = Worker::new(
            Arc::new(builtin_catalog().unwrap()),
            cfg,
            AssocNetConfig::default(),
            Arc::clone(&stepper),
        );
        (w, stepper)
    }

    #[test]
    fn launch_pause_resume_stop() {
        let (mut w, stepper) = worker();
        let events = stepper.subscribe().unwrap();
        w.launch(RENEWAL_RUN, Granularity::Trial, 2).unwrap();
        assert!(matches!(w.launch(RENEWAL_RUN, Granularity::Trial, 1), Err(WorkerError::Busy)));

        let timeout = Duration::from_secs(10);
        assert_eq!(
            events.recv_timeout(timeout),
            Ok(StepperEvent::Paused { at: Granularity::Trial })
        );
        let snap = w.snapshot().unwrap();
        assert_eq!(snap.counters.trial.cur, 2);

        stepper.stop().unwrap();
        w.join();
        assert!(!w.is_alive());
        assert_eq!(w.last_outcome().as_deref(), Some("Stopped"));
        assert_eq!(stepper.state(), RunState::Stopped);

        // A new run may start once the old one is gone.
        w.launch("Partial", Granularity::Cycle, 0).unwrap();
        w.join();
        assert_eq!(w.last_outcome().as_deref(), Some("Completed"));
        assert!(w.snapshot().unwrap().complete);
    }

    #[test]
    fn unknown_run_does_not_arm_the_stepper() {
        let (mut w, stepper) = worker();
        assert!(matches!(
            w.launch("Nope", Granularity::Trial, 1),
            Err(WorkerError::Orchestrator(OrchestratorError::UnknownRun(_)))
        ));
        assert_eq!(stepper.state(), RunState::Stopped);
        assert!(w.current_run().is_none());
    }
}
