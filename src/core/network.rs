//! The seam to the external simulation engine.
//!
//! The scheduler never looks inside the network: it pushes one row of inputs
//! per alpha tick, advances cycles, closes quarters and asks for weight
//! updates. Anything that can do those four things can be driven.

use thiserror::Error;

use crate::codes::SparseCode;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("unknown input layer {0:?}")]
    UnknownLayer(String),
    #[error("layer {layer:?} expects {expected} units, got {got}")]
    Shape {
        layer: String,
        expected: usize,
        got: usize,
    },
    #[error("{0}")]
    Other(String),
}

pub trait Network {
    /// Clamp `input` onto the named input layer for the coming alpha tick.
    fn apply_external_input(&mut self, layer: &str, input: &SparseCode) -> Result<(), NetworkError>;

    /// Advance one elementary time step.
    fn run_one_cycle(&mut self) -> Result<(), NetworkError>;

    /// Close quarter `quarter` (0-based) of the current alpha tick.
    fn finalize_quarter(&mut self, quarter: usize) -> Result<(), NetworkError>;

    /// Called once per alpha tick, after the plus quarter, in training mode.
    fn compute_and_apply_weight_updates(&mut self) -> Result<(), NetworkError>;

    /// Checkpoint hook, called every `save_wts_interval` trial-blocks.
    fn save_weights(&mut self, _label: &str) -> Result<(), NetworkError> {
        Ok(())
    }
}

impl<N: Network + ?Sized> Network for Box<N> {
    fn apply_external_input(&mut self, layer: &str, input: &SparseCode) -> Result<(), NetworkError> {
        (**self).apply_external_input(layer, input)
    }

    fn run_one_cycle(&mut self) -> Result<(), NetworkError> {
        (**self).run_one_cycle()
    }

    fn finalize_quarter(&mut self, quarter: usize) -> Result<(), NetworkError> {
        (**self).finalize_quarter(quarter)
    }

    fn compute_and_apply_weight_updates(&mut self) -> Result<(), NetworkError> {
        (**self).compute_and_apply_weight_updates()
    }

    fn save_weights(&mut self, label: &str) -> Result<(), NetworkError> {
        (**self).save_weights(label)
    }
}
