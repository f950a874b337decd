//! Interruptible stepping at a chosen granularity.
//!
//! A [`Stepper`] is shared (behind an `Arc`) between the worker thread that
//! runs a nested loop and a control thread that starts, pauses, resumes and
//! stops it. The worker calls [`Stepper::step_point`] at every boundary of
//! every level; the call answers "return now" or "keep going".
//!
//! All mutable state lives behind one mutex. Stop-check and pause callbacks
//! are invoked while that mutex is held, so they must not call back into the
//! stepper; doing so yields [`StepperError::Reentrant`] instead of a deadlock.

use std::cell::Cell;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Condvar, Mutex, MutexGuard, PoisonError};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Loop levels, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Granularity {
    Cycle,
    Quarter,
    MinusPhase,
    AlphaCycle,
    Trial,
    TrialBlock,
    Condition,
}

impl Granularity {
    pub const ALL: [Granularity; 7] = [
        Granularity::Cycle,
        Granularity::Quarter,
        Granularity::MinusPhase,
        Granularity::AlphaCycle,
        Granularity::Trial,
        Granularity::TrialBlock,
        Granularity::Condition,
    ];

    fn level(self) -> u8 {
        match self {
            Granularity::Cycle => 0,
            Granularity::Quarter => 1,
            Granularity::MinusPhase => 2,
            Granularity::AlphaCycle => 3,
            Granularity::Trial => 4,
            Granularity::TrialBlock => 5,
            Granularity::Condition => 6,
        }
    }

    pub fn is_coarser_than(self, other: Granularity) -> bool {
        self.level() > other.level()
    }

    pub fn name(self) -> &'static str {
        match self {
            Granularity::Cycle => "cycle",
            Granularity::Quarter => "quarter",
            Granularity::MinusPhase => "minus_phase",
            Granularity::AlphaCycle => "alpha_cycle",
            Granularity::Trial => "trial",
            Granularity::TrialBlock => "trial_block",
            Granularity::Condition => "condition",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown granularity {0:?}")]
pub struct ParseGranularityError(pub String);

impl FromStr for Granularity {
    type Err = ParseGranularityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('-', "_");
        Granularity::ALL
            .into_iter()
            .find(|g| g.name() == norm || g.name().replace('_', "") == norm)
            .ok_or_else(|| ParseGranularityError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RunState {
    Stopped,
    Running,
    Paused,
}

impl RunState {
    fn to_u8(self) -> u8 {
        match self {
            RunState::Stopped => 0,
            RunState::Running => 1,
            RunState::Paused => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Running,
            2 => RunState::Paused,
            _ => RunState::Stopped,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepperError {
    #[error("cannot {op} while {state:?}")]
    InvalidTransition { op: &'static str, state: RunState },
    #[error("{op} called from inside a stepper callback")]
    Reentrant { op: &'static str },
}

/// Posted to subscribers whenever the worker comes to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepperEvent {
    Paused { at: Granularity },
    /// `at` is `None` when the stop came from [`Stepper::stop`].
    Stopped { at: Option<Granularity> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepperSnapshot {
    pub state: RunState,
    pub granularity: Granularity,
    /// Configured step budget; 0 runs freely.
    pub steps: u32,
    pub remaining: u32,
    pub pause_requested: bool,
}

pub type StopCheck = Box<dyn FnMut(Granularity) -> bool + Send>;
pub type PauseNotifier = Box<dyn FnMut(Granularity) + Send>;

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

struct CallbackGuard;

impl CallbackGuard {
    fn enter() -> Self {
        IN_CALLBACK.with(|f| f.set(true));
        CallbackGuard
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        IN_CALLBACK.with(|f| f.set(false));
    }
}

fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

fn check_reentry(op: &'static str) -> Result<(), StepperError> {
    if in_callback() {
        Err(StepperError::Reentrant { op })
    } else {
        Ok(())
    }
}

struct Inner {
    state: RunState,
    grain: Granularity,
    steps: u32,
    remaining: u32,
    pause_requested: bool,
    stop_check: Option<StopCheck>,
    on_pause: Option<PauseNotifier>,
    subscribers: Vec<mpsc::Sender<StepperEvent>>,
}

impl Inner {
    fn arm(&mut self, grain: Granularity, steps: u32) {
        self.grain = grain;
        self.steps = steps;
        self.remaining = steps;
        self.pause_requested = false;
    }

    fn post(&mut self, ev: StepperEvent) {
        self.subscribers.retain(|tx| tx.send(ev).is_ok());
    }
}

pub struct Stepper {
    inner: Mutex<Inner>,
    changed: Condvar,
    // Written only with `inner` locked; lets `state()` answer from anywhere.
    state: AtomicU8,
}

impl Default for Stepper {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Stepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stepper").field("state", &self.state()).finish()
    }
}

impl Stepper {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RunState::Stopped,
                grain: Granularity::Trial,
                steps: 0,
                remaining: 0,
                pause_requested: false,
                stop_check: None,
                on_pause: None,
                subscribers: Vec::new(),
            }),
            changed: Condvar::new(),
            state: AtomicU8::new(RunState::Stopped.to_u8()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, inner: &mut Inner, state: RunState) {
        inner.state = state;
        self.state.store(state.to_u8(), Ordering::Release);
        self.changed.notify_all();
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> Result<StepperSnapshot, StepperError> {
        check_reentry("snapshot")?;
        let inner = self.lock();
        Ok(StepperSnapshot {
            state: inner.state,
            granularity: inner.grain,
            steps: inner.steps,
            remaining: inner.remaining,
            pause_requested: inner.pause_requested,
        })
    }

    /// Begin running. `steps == 0` runs until stopped or paused by request.
    ///
    /// Only meaningful from `Stopped`; otherwise this logs and does nothing.
    pub fn start(&self, grain: Granularity, steps: u32) -> Result<(), StepperError> {
        check_reentry("start")?;
        let mut inner = self.lock();
        if inner.state != RunState::Stopped {
            warn!(state = ?inner.state, "start ignored: stepper already active");
            return Ok(());
        }
        inner.arm(grain, steps);
        self.enter(&mut inner, RunState::Running);
        debug!(%grain, steps, "stepper started");
        Ok(())
    }

    /// Ask the worker to pause at its next boundary of any granularity.
    ///
    /// The armed granularity only governs the step budget; a pause request
    /// is honoured within one cycle.
    pub fn pause(&self) -> Result<(), StepperError> {
        check_reentry("pause")?;
        let mut inner = self.lock();
        if inner.state != RunState::Running {
            return Err(StepperError::InvalidTransition {
                op: "pause",
                state: inner.state,
            });
        }
        inner.pause_requested = true;
        Ok(())
    }

    pub fn resume(&self, grain: Granularity, steps: u32) -> Result<(), StepperError> {
        check_reentry("resume")?;
        let mut inner = self.lock();
        if inner.state != RunState::Paused {
            return Err(StepperError::InvalidTransition {
                op: "resume",
                state: inner.state,
            });
        }
        inner.arm(grain, steps);
        self.enter(&mut inner, RunState::Running);
        debug!(%grain, steps, "stepper resumed");
        Ok(())
    }

    /// Valid from any state. A paused worker blocked in
    /// [`Stepper::wait_while_paused`] wakes up and sees `Stopped`.
    pub fn stop(&self) -> Result<(), StepperError> {
        check_reentry("stop")?;
        let mut inner = self.lock();
        inner.pause_requested = false;
        inner.remaining = 0;
        if inner.state != RunState::Stopped {
            self.enter(&mut inner, RunState::Stopped);
            inner.post(StepperEvent::Stopped { at: None });
            debug!("stepper stopped");
        }
        Ok(())
    }

    /// Install the predicate consulted at every boundary. Returning `true`
    /// stops the run.
    pub fn set_stop_check<F>(&self, check: F) -> Result<(), StepperError>
    where
        F: FnMut(Granularity) -> bool + Send + 'static,
    {
        check_reentry("set_stop_check")?;
        self.lock().stop_check = Some(Box::new(check));
        Ok(())
    }

    /// Install the callback run when the worker pauses.
    pub fn set_pause_notifier<F>(&self, notify: F) -> Result<(), StepperError>
    where
        F: FnMut(Granularity) + Send + 'static,
    {
        check_reentry("set_pause_notifier")?;
        self.lock().on_pause = Some(Box::new(notify));
        Ok(())
    }

    pub fn subscribe(&self) -> Result<mpsc::Receiver<StepperEvent>, StepperError> {
        check_reentry("subscribe")?;
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        Ok(rx)
    }

    /// Called by the worker at the end of every `grain` unit. Returns `true`
    /// when the worker must return from its loop.
    pub fn step_point(&self, grain: Granularity) -> bool {
        if in_callback() {
            error!(%grain, "step_point called from inside a stepper callback");
            return true;
        }
        let mut inner = self.lock();
        if inner.state != RunState::Running {
            return true;
        }

        let stop = match inner.stop_check.as_mut() {
            Some(check) => {
                let _guard = CallbackGuard::enter();
                check(grain)
            }
            None => false,
        };
        if stop {
            inner.pause_requested = false;
            self.enter(&mut inner, RunState::Stopped);
            inner.post(StepperEvent::Stopped { at: Some(grain) });
            debug!(%grain, "stop condition met");
            return true;
        }

        let mut pause = inner.pause_requested;
        if inner.steps > 0 && grain == inner.grain {
            inner.remaining = inner.remaining.saturating_sub(1);
            pause |= inner.remaining == 0;
        }
        if !pause {
            return false;
        }

        inner.pause_requested = false;
        self.enter(&mut inner, RunState::Paused);
        if let Some(notify) = inner.on_pause.as_mut() {
            let _guard = CallbackGuard::enter();
            notify(grain);
        }
        inner.post(StepperEvent::Paused { at: grain });
        debug!(%grain, "stepper paused");
        true
    }

    /// Block until the stepper leaves `Paused`; returns the new state.
    pub fn wait_while_paused(&self) -> RunState {
        if in_callback() {
            return self.state();
        }
        let mut inner = self.lock();
        while inner.state == RunState::Paused {
            inner = self
                .changed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        inner.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn granularity_ordering() {
        assert!(Granularity::Trial.is_coarser_than(Granularity::AlphaCycle));
        assert!(Granularity::Condition.is_coarser_than(Granularity::Cycle));
        assert!(!Granularity::Cycle.is_coarser_than(Granularity::Cycle));
        for w in Granularity::ALL.windows(2) {
            assert!(w[1].is_coarser_than(w[0]));
        }
    }

    #[test]
    fn granularity_parses_its_names() {
        for g in Granularity::ALL {
            assert_eq!(g.name().parse::<Granularity>().unwrap(), g);
        }
        assert_eq!("TrialBlock".parse::<Granularity>().unwrap(), Granularity::TrialBlock);
        assert_eq!("alpha-cycle".parse::<Granularity>().unwrap(), Granularity::AlphaCycle);
        assert!("epoch".parse::<Granularity>().is_err());
    }

    #[test]
    fn start_only_from_stopped() {
        let s = Stepper::new();
        s.start(Granularity::Trial, 2).unwrap();
        assert_eq!(s.state(), RunState::Running);

        // Second start is a no-op and keeps the original arming.
        s.start(Granularity::Cycle, 9).unwrap();
        let snap = s.snapshot().unwrap();
        assert_eq!(snap.granularity, Granularity::Trial);
        assert_eq!(snap.steps, 2);
    }

    #[test]
    fn resume_and_pause_require_the_right_state() {
        let s = Stepper::new();
        assert_eq!(
            s.resume(Granularity::Trial, 1),
            Err(StepperError::InvalidTransition {
                op: "resume",
                state: RunState::Stopped
            })
        );
        assert!(s.pause().is_err());
        assert_eq!(s.state(), RunState::Stopped);

        s.start(Granularity::Trial, 0).unwrap();
        assert!(s.resume(Granularity::Trial, 1).is_err());
    }

    #[test]
    fn step_budget_counts_only_the_armed_granularity() {
        let s = Stepper::new();
        s.start(Granularity::Trial, 3).unwrap();
        for trial in 1..=3 {
            for _ in 0..10 {
                assert!(!s.step_point(Granularity::Cycle));
                assert!(!s.step_point(Granularity::AlphaCycle));
            }
            let paused = s.step_point(Granularity::Trial);
            assert_eq!(paused, trial == 3, "trial {trial}");
        }
        assert_eq!(s.state(), RunState::Paused);
        // While paused every boundary says return.
        assert!(s.step_point(Granularity::Cycle));
    }

    #[test]
    fn coarser_boundaries_do_not_spend_the_budget() {
        let s = Stepper::new();
        s.start(Granularity::Trial, 2).unwrap();
        assert!(!s.step_point(Granularity::TrialBlock));
        assert!(!s.step_point(Granularity::Trial));
        assert!(s.step_point(Granularity::Trial));
    }

    #[test]
    fn pause_request_fires_at_the_next_boundary() {
        let s = Stepper::new();
        s.start(Granularity::Trial, 0).unwrap();
        s.pause().unwrap();
        assert!(s.step_point(Granularity::AlphaCycle));
        assert_eq!(s.state(), RunState::Paused);

        s.resume(Granularity::Cycle, 0).unwrap();
        assert!(!s.snapshot().unwrap().pause_requested);
        assert!(!s.step_point(Granularity::Cycle));
    }

    #[test]
    fn coarse_arming_still_pauses_within_one_cycle() {
        let s = Stepper::new();
        s.start(Granularity::Condition, 0).unwrap();
        assert!(!s.step_point(Granularity::Cycle));
        s.pause().unwrap();
        assert!(s.step_point(Granularity::Cycle));
        assert_eq!(s.state(), RunState::Paused);
        let snap = s.snapshot().unwrap();
        assert_eq!(snap.granularity, Granularity::Condition);
        assert!(!snap.pause_requested);
    }

    #[test]
    fn pause_request_does_not_spend_the_budget() {
        let s = Stepper::new();
        s.start(Granularity::Trial, 2).unwrap();
        s.pause().unwrap();
        assert!(s.step_point(Granularity::Cycle));
        assert_eq!(s.snapshot().unwrap().remaining, 2);
    }

    #[test]
    fn stop_check_ends_the_run() {
        let s = Stepper::new();
        s.set_stop_check(|g| g == Granularity::Condition).unwrap();
        s.start(Granularity::Cycle, 0).unwrap();
        assert!(!s.step_point(Granularity::TrialBlock));
        assert!(s.step_point(Granularity::Condition));
        assert_eq!(s.state(), RunState::Stopped);
    }

    #[test]
    fn callbacks_cannot_reenter() {
        let s = Arc::new(Stepper::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&s);
        let sink = Arc::clone(&seen);
        s.set_pause_notifier(move |_| {
            if let Some(s) = weak.upgrade() {
                sink.lock().unwrap().push(s.pause());
                sink.lock().unwrap().push(s.stop());
                assert_eq!(s.state(), RunState::Paused);
            }
        })
        .unwrap();

        s.start(Granularity::Quarter, 1).unwrap();
        assert!(s.step_point(Granularity::Quarter));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Err(StepperError::Reentrant { op: "pause" }),
                Err(StepperError::Reentrant { op: "stop" }),
            ]
        );
        // The lock was released and the guard cleared.
        s.stop().unwrap();
        assert_eq!(s.state(), RunState::Stopped);
    }

    #[test]
    fn subscribers_see_pause_and_stop() {
        let s = Stepper::new();
        let rx = s.subscribe().unwrap();
        s.start(Granularity::Cycle, 1).unwrap();
        assert!(s.step_point(Granularity::Cycle));
        s.stop().unwrap();
        assert_eq!(rx.try_recv(), Ok(StepperEvent::Paused { at: Granularity::Cycle }));
        assert_eq!(rx.try_recv(), Ok(StepperEvent::Stopped { at: None }));
    }

    #[test]
    fn stop_releases_a_paused_worker() {
        let s = Arc::new(Stepper::new());
        let events = s.subscribe().unwrap();
        s.start(Granularity::Cycle, 5).unwrap();

        let worker = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                let mut cycles = 0u32;
                loop {
                    cycles += 1;
                    if s.step_point(Granularity::Cycle) {
                        if s.wait_while_paused() == RunState::Stopped {
                            return cycles;
                        }
                    }
                }
            })
        };

        let timeout = Duration::from_secs(5);
        assert_eq!(
            events.recv_timeout(timeout),
            Ok(StepperEvent::Paused { at: Granularity::Cycle })
        );
        s.resume(Granularity::Cycle, 2).unwrap();
        assert_eq!(
            events.recv_timeout(timeout),
            Ok(StepperEvent::Paused { at: Granularity::Cycle })
        );
        s.stop().unwrap();
        assert_eq!(worker.join().unwrap(), 7);
        assert_eq!(s.state(), RunState::Stopped);
    }
}
