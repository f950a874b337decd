//! A toy delta-rule network, enough to watch a schedule shape behaviour.
//!
//! Stimulus, context and US-timing units project onto the primary-value
//! units; the timing units let the net expect the US at the right tick. During
//! the minus phase the PV units settle toward the learned prediction; the
//! plus quarter clamps them to the delivered outcome. Weights move by the
//! difference, which is the Rescorla-Wagner error.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codes::{
    pv_index, us_time_index, CodeError, ContextCode, ContextMode, SparseCode, StimulusCode, Valence,
};
use crate::codes::{CONTEXT_DIM, PV_DIM, STIM_DIM, US_TIME_DIM};
use crate::network::{Network, NetworkError};
use crate::orchestrator::PLUS_QUARTER;
use crate::unroller::{CONTEXT_LAYER, PV_LAYER, STIM_LAYER, US_TIME_LAYER};

const CONTEXT_OFFSET: usize = STIM_DIM;
const TIME_OFFSET: usize = STIM_DIM + CONTEXT_DIM;
const INPUT_DIM: usize = TIME_OFFSET + US_TIME_DIM;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AssocNetConfig {
    pub learning_rate: f32,
    /// Fraction of the gap to the prediction closed per cycle.
    pub settle_rate: f32,
}

impl Default for AssocNetConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            settle_rate: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssociativeNet {
    cfg: AssocNetConfig,
    input: Vec<f32>,
    target: Vec<f32>,
    weights: Vec<f32>,
    act: Vec<f32>,
    minus: Vec<f32>,
    plus: Vec<f32>,

    cycles: u64,
    updates: u64,
    saved: Vec<String>,
}

impl Default for AssociativeNet {
    fn default() -> Self {
        Self::new(AssocNetConfig::default())
    }
}

impl AssociativeNet {
    pub fn new(cfg: AssocNetConfig) -> Self {
        Self {
            cfg,
            input: vec![0.0; INPUT_DIM],
            target: vec![0.0; PV_DIM],
            weights: vec![0.0; INPUT_DIM * PV_DIM],
            act: vec![0.0; PV_DIM],
            minus: vec![0.0; PV_DIM],
            plus: vec![0.0; PV_DIM],
            cycles: 0,
            updates: 0,
            saved: Vec::new(),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn saved_labels(&self) -> &[String] {
        &self.saved
    }

    fn predict(&self, input: &[f32], out: &mut [f32]) {
        out.fill(0.0);
        for (i, &x) in input.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            let row = &self.weights[i * PV_DIM..(i + 1) * PV_DIM];
            for (o, w) in out.iter_mut().zip(row) {
                *o += x * w;
            }
        }
    }

    /// Learned expectation of the given outcome for a CS presented in a
    /// context, `elapsed` ticks after CS onset. Network state is untouched.
    pub fn response(
        &self,
        cs: &str,
        context: &str,
        mode: ContextMode,
        valence: Valence,
        us_index: usize,
        elapsed: usize,
    ) -> Result<f32, CodeError> {
        let cs = StimulusCode::parse(cs)?;
        let ctx = ContextCode::parse(context)?;
        let mut input = vec![0.0; INPUT_DIM];
        input[cs.first] = 1.0;
        if let Some(second) = cs.second {
            input[second] = 1.0;
        }
        for c in ctx.active_indices(mode) {
            input[CONTEXT_OFFSET + c] = 1.0;
        }
        if elapsed > 0 {
            input[TIME_OFFSET + us_time_index(valence, us_index, elapsed)?] = 1.0;
        }
        let mut out = vec![0.0; PV_DIM];
        self.predict(&input, &mut out);
        Ok(out[pv_index(valence, us_index)?])
    }
}

fn load(dst: &mut [f32], layer: &str, code: &SparseCode) -> Result<(), NetworkError> {
    if code.dim() != dst.len() {
        return Err(NetworkError::Shape {
            layer: layer.to_string(),
            expected: dst.len(),
            got: code.dim(),
        });
    }
    dst.fill(0.0);
    for &(i, v) in code.active() {
        dst[i] = v;
    }
    Ok(())
}

impl Network for AssociativeNet {
    fn apply_external_input(&mut self, layer: &str, input: &SparseCode) -> Result<(), NetworkError> {
        match layer {
            STIM_LAYER => load(&mut self.input[..CONTEXT_OFFSET], layer, input),
            CONTEXT_LAYER => load(&mut self.input[CONTEXT_OFFSET..TIME_OFFSET], layer, input),
            US_TIME_LAYER => load(&mut self.input[TIME_OFFSET..], layer, input),
            PV_LAYER => load(&mut self.target, layer, input),
            other => Err(NetworkError::UnknownLayer(other.to_string())),
        }
    }

    fn run_one_cycle(&mut self) -> Result<(), NetworkError> {
        let mut pred = vec![0.0; PV_DIM];
        self.predict(&self.input, &mut pred);
        let rate = self.cfg.settle_rate;
        for (a, p) in self.act.iter_mut().zip(&pred) {
            *a += rate * (p - *a);
        }
        self.cycles += 1;
        Ok(())
    }

    fn finalize_quarter(&mut self, quarter: usize) -> Result<(), NetworkError> {
        if quarter + 1 == PLUS_QUARTER {
            self.minus.copy_from_slice(&self.act);
        } else if quarter == PLUS_QUARTER {
            self.plus.copy_from_slice(&self.target);
            self.act.copy_from_slice(&self.target);
        }
        Ok(())
    }

    fn compute_and_apply_weight_updates(&mut self) -> Result<(), NetworkError> {
        let lr = self.cfg.learning_rate;
        for (i, &x) in self.input.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            let row = &mut self.weights[i * PV_DIM..(i + 1) * PV_DIM];
            for ((w, p), m) in row.iter_mut().zip(&self.plus).zip(&self.minus) {
                *w += lr * (p - m) * x;
            }
        }
        self.updates += 1;
        Ok(())
    }

    fn save_weights(&mut self, label: &str) -> Result<(), NetworkError> {
        debug!(label, updates = self.updates, "weights checkpoint");
        self.saved.push(label.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(net: &mut AssociativeNet, reinforced: bool) {
        let mut stim = SparseCode::new(STIM_DIM);
        stim.set(0, 1.0);
        let mut ctx = SparseCode::new(CONTEXT_DIM);
        ctx.set(0, 1.0);
        let mut pv = SparseCode::new(PV_DIM);
        if reinforced {
            pv.set(0, 1.0);
        }
        net.apply_external_input(STIM_LAYER, &stim).unwrap();
        net.apply_external_input(CONTEXT_LAYER, &ctx).unwrap();
        net.apply_external_input(PV_LAYER, &pv).unwrap();
        for q in 0..4 {
            for _ in 0..10 {
                net.run_one_cycle().unwrap();
            }
            net.finalize_quarter(q).unwrap();
        }
        net.compute_and_apply_weight_updates().unwrap();
    }

    fn expectation(net: &AssociativeNet) -> f32 {
        net.response("A", "A", ContextMode::Elemental, Valence::Positive, 0, 0)
            .unwrap()
    }

    #[test]
    fn learns_then_extinguishes() {
        let mut net = AssociativeNet::default();
        assert_eq!(expectation(&net), 0.0);
        for _ in 0..40 {
            present(&mut net, true);
        }
        let learned = expectation(&net);
        assert!(learned > 0.5, "learned={learned}");

        for _ in 0..40 {
            present(&mut net, false);
        }
        assert!(expectation(&net) < learned * 0.5);
        assert_eq!(net.updates(), 80);
    }

    #[test]
    fn rejects_unknown_layers_and_wrong_sizes() {
        let mut net = AssociativeNet::default();
        let code = SparseCode::new(STIM_DIM);
        assert!(matches!(
            net.apply_external_input("Hidden", &code),
            Err(NetworkError::UnknownLayer(_))
        ));
        assert!(matches!(
            net.apply_external_input(PV_LAYER, &code),
            Err(NetworkError::Shape { expected: PV_DIM, .. })
        ));
        assert!(net
            .apply_external_input(US_TIME_LAYER, &SparseCode::new(US_TIME_DIM))
            .is_ok());
    }
}
