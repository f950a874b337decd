//! Scheduling for conditioning experiments.
//!
//! A [`schedule::Catalog`] describes runs, conditions and weighted trial
//! templates. The [`orchestrator::Orchestrator`] expands them into trials,
//! unrolls each trial into per-tick input rows and drives any
//! [`network::Network`] through cycles and quarters, while a
//! [`stepper::Stepper`] lets another thread pause, resume or stop the run at
//! any loop boundary.

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/codes.rs"]
pub mod codes;

#[path = "core/schedule.rs"]
pub mod schedule;

#[path = "core/generator.rs"]
pub mod generator;

#[path = "core/unroller.rs"]
pub mod unroller;

#[path = "core/counters.rs"]
pub mod counters;

#[path = "core/network.rs"]
pub mod network;

#[path = "core/stepper.rs"]
pub mod stepper;

#[path = "core/orchestrator.rs"]
pub mod orchestrator;

pub mod experiments;
pub mod observer;

pub mod prelude {
    pub use crate::codes::{ContextMode, SparseCode, Valence};
    pub use crate::counters::{Counter, Counters};
    pub use crate::generator::{TrialInstance, TrialInstanceGenerator};
    pub use crate::network::{Network, NetworkError};
    pub use crate::observer::ScheduleSnapshot;
    pub use crate::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, RunOutcome};
    pub use crate::schedule::{Catalog, CatalogError, Condition, RunSequence, TrialBlockTemplate};
    pub use crate::stepper::{Granularity, RunState, Stepper, StepperError, StepperEvent};
    pub use crate::unroller::{AlphaRow, AlphaTrialUnroller};
}
