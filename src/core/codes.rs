//! Fixed-size code spaces for the four input encodings.
//!
//! Every input row is a sparse vector over one of these spaces:
//!
//! | space     | layout                                                        |
//! |-----------|---------------------------------------------------------------|
//! | stimulus  | one code per CS letter `A`..`L`                               |
//! | context   | elemental `letter × variant`, then conjunctive `pair × variant` |
//! | pv        | `valence × us_index`                                          |
//! | us_time   | `valence × us_index × elapsed tick`                           |
//!
//! A context variant is the base context (0) or a sub-context `_1`..`_3`.

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const STIM_LETTERS: usize = 12;
pub const CONTEXT_LETTERS: usize = 8;
pub const CONTEXT_VARIANTS: usize = 4;
pub const US_TYPES: usize = 4;
pub const MAX_ALPHA_TICKS: usize = 16;

pub const STIM_DIM: usize = STIM_LETTERS;
const CONTEXT_PAIRS: usize = CONTEXT_LETTERS * (CONTEXT_LETTERS - 1) / 2;
const CONTEXT_ELEMENTAL_DIM: usize = CONTEXT_LETTERS * CONTEXT_VARIANTS;
pub const CONTEXT_DIM: usize = CONTEXT_ELEMENTAL_DIM + CONTEXT_PAIRS * CONTEXT_VARIANTS;
pub const PV_DIM: usize = 2 * US_TYPES;
pub const US_TIME_DIM: usize = 2 * US_TYPES * MAX_ALPHA_TICKS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("empty {kind} code")]
    Empty { kind: &'static str },
    #[error("{kind} code {code:?}: letter {letter:?} outside A..{last}")]
    Letter {
        kind: &'static str,
        code: String,
        letter: char,
        last: char,
    },
    #[error("{kind} code {code:?} has {n} components; at most 2 are supported")]
    TooManyComponents {
        kind: &'static str,
        code: String,
        n: usize,
    },
    #[error("{kind} code {code:?} repeats component {letter:?}")]
    Repeated {
        kind: &'static str,
        code: String,
        letter: char,
    },
    #[error("context code {code:?}: sub-context {suffix:?} is not one of _1, _2, _3")]
    SubContext { code: String, suffix: String },
    #[error("us_index {0} out of range (max {max})", max = US_TYPES - 1)]
    UsIndex(usize),
    #[error("tick {0} exceeds the {max}-tick code space", max = MAX_ALPHA_TICKS)]
    Tick(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Valence {
    #[default]
    Positive,
    Negative,
}

impl Valence {
    fn block(self) -> usize {
        match self {
            Valence::Positive => 0,
            Valence::Negative => 1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Valence::Positive => Valence::Negative,
            Valence::Negative => Valence::Positive,
        }
    }
}

/// How a compound context is presented to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ContextMode {
    /// One independent code per component.
    #[default]
    Elemental,
    /// A single joint code for the whole compound.
    Conjunctive,
    /// Elemental and conjunctive codes together.
    Both,
}

fn letter_index(kind: &'static str, code: &str, c: char, n: usize) -> Result<usize, CodeError> {
    let last = (b'A' + n as u8 - 1) as char;
    if c.is_ascii_uppercase() && (c as usize - 'A' as usize) < n {
        Ok(c as usize - 'A' as usize)
    } else {
        Err(CodeError::Letter {
            kind,
            code: code.to_string(),
            letter: c,
            last,
        })
    }
}

fn parse_components(kind: &'static str, code: &str, n: usize) -> Result<Vec<usize>, CodeError> {
    if code.is_empty() {
        return Err(CodeError::Empty { kind });
    }
    let letters: Vec<char> = code.chars().collect();
    if letters.len() > 2 {
        return Err(CodeError::TooManyComponents {
            kind,
            code: code.to_string(),
            n: letters.len(),
        });
    }
    if letters.len() == 2 && letters[0] == letters[1] {
        return Err(CodeError::Repeated {
            kind,
            code: code.to_string(),
            letter: letters[0],
        });
    }
    letters
        .into_iter()
        .map(|c| letter_index(kind, code, c, n))
        .collect()
}

/// A conditioned stimulus: one letter, or a two-letter compound whose
/// second member follows the CS2 timing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StimulusCode {
    pub first: usize,
    pub second: Option<usize>,
}

impl StimulusCode {
    pub fn parse(code: &str) -> Result<Self, CodeError> {
        let parts = parse_components("stimulus", code, STIM_LETTERS)?;
        Ok(Self {
            first: parts[0],
            second: parts.get(1).copied(),
        })
    }

    pub fn is_compound(&self) -> bool {
        self.second.is_some()
    }
}

/// A context: one or two component letters plus an optional sub-context
/// suffix (`"AB_2"`), which swaps every component for its phase variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextCode {
    components: Vec<usize>,
    variant: usize,
}

impl ContextCode {
    pub fn parse(code: &str) -> Result<Self, CodeError> {
        let (base, variant) = match code.split_once('_') {
            Some((base, suffix)) => {
                let variant = match suffix {
                    "1" => 1,
                    "2" => 2,
                    "3" => 3,
                    _ => {
                        return Err(CodeError::SubContext {
                            code: code.to_string(),
                            suffix: suffix.to_string(),
                        })
                    }
                };
                (base, variant)
            }
            None => (code, 0),
        };
        let components = parse_components("context", base, CONTEXT_LETTERS)?;
        Ok(Self {
            components,
            variant,
        })
    }

    pub fn components(&self) -> &[usize] {
        &self.components
    }

    pub fn variant(&self) -> usize {
        self.variant
    }

    fn elemental_index(&self, component: usize) -> usize {
        component * CONTEXT_VARIANTS + self.variant
    }

    fn conjunctive_index(&self) -> Option<usize> {
        let (a, b) = match self.components.as_slice() {
            [a, b] => ((*a).min(*b), (*a).max(*b)),
            _ => return None,
        };
        // Rank of (a, b) with a < b in row-major upper-triangle order.
        let pair = a * (2 * CONTEXT_LETTERS - a - 1) / 2 + (b - a - 1);
        Some(CONTEXT_ELEMENTAL_DIM + pair * CONTEXT_VARIANTS + self.variant)
    }

    /// Indices active for this context under `mode`.
    ///
    /// A single-component context has no separate joint code, so every mode
    /// yields its one elemental code.
    pub fn active_indices(&self, mode: ContextMode) -> Vec<usize> {
        let elemental = self.components.iter().map(|&c| self.elemental_index(c));
        match (mode, self.conjunctive_index()) {
            (_, None) | (ContextMode::Elemental, _) => elemental.collect(),
            (ContextMode::Conjunctive, Some(joint)) => vec![joint],
            (ContextMode::Both, Some(joint)) => {
                let mut out: Vec<usize> = elemental.collect();
                out.push(joint);
                out
            }
        }
    }
}

pub fn pv_index(valence: Valence, us_index: usize) -> Result<usize, CodeError> {
    if us_index >= US_TYPES {
        return Err(CodeError::UsIndex(us_index));
    }
    Ok(valence.block() * US_TYPES + us_index)
}

pub fn us_time_index(valence: Valence, us_index: usize, elapsed: usize) -> Result<usize, CodeError> {
    if elapsed >= MAX_ALPHA_TICKS {
        return Err(CodeError::Tick(elapsed));
    }
    Ok(pv_index(valence, us_index)? * MAX_ALPHA_TICKS + elapsed)
}

/// Sparse one-hot-style vector over a fixed-size code space.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SparseCode {
    dim: usize,
    active: Vec<(usize, f32)>,
}

impl SparseCode {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            active: Vec::new(),
        }
    }

    /// Set `index` to `value`, replacing any earlier value at that index.
    pub fn set(&mut self, index: usize, value: f32) {
        debug_assert!(index < self.dim, "code {} outside dim {}", index, self.dim);
        match self.active.iter_mut().find(|(i, _)| *i == index) {
            Some(slot) => slot.1 = value,
            None => self.active.push((index, value)),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn active(&self) -> &[(usize, f32)] {
        &self.active
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn value(&self, index: usize) -> f32 {
        self.active
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.active.iter().any(|(i, _)| *i == index)
    }

    /// Dense copy of length `dim`. Indices outside the space, which only a
    /// malformed deserialized code can hold, are dropped.
    pub fn to_dense(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.dim];
        for &(i, v) in &self.active {
            if let Some(slot) = out.get_mut(i) {
                *slot = v;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stimulus_parses_single_and_compound() {
        let a = StimulusCode::parse("A").unwrap();
        assert_eq!(a.first, 0);
        assert!(!a.is_compound());

        let ab = StimulusCode::parse("CB").unwrap();
        assert_eq!((ab.first, ab.second), (2, Some(1)));
    }

    #[test]
    fn stimulus_rejects_bad_letters() {
        assert!(matches!(
            StimulusCode::parse("Z"),
            Err(CodeError::Letter { letter: 'Z', .. })
        ));
        assert!(matches!(
            StimulusCode::parse("ABC"),
            Err(CodeError::TooManyComponents { n: 3, .. })
        ));
        assert!(matches!(
            StimulusCode::parse("AA"),
            Err(CodeError::Repeated { .. })
        ));
        assert!(matches!(StimulusCode::parse(""), Err(CodeError::Empty { .. })));
    }

    #[test]
    fn context_mode_arity() {
        let ctx = ContextCode::parse("AB").unwrap();
        assert_eq!(ctx.active_indices(ContextMode::Elemental).len(), 2);
        assert_eq!(ctx.active_indices(ContextMode::Conjunctive).len(), 1);
        assert_eq!(ctx.active_indices(ContextMode::Both).len(), 3);

        let single = ContextCode::parse("C").unwrap();
        for mode in [ContextMode::Elemental, ContextMode::Conjunctive, ContextMode::Both] {
            assert_eq!(single.active_indices(mode).len(), 1);
        }
    }

    #[test]
    fn conjunctive_code_ignores_component_order() {
        let ab = ContextCode::parse("AB").unwrap();
        let ba = ContextCode::parse("BA").unwrap();
        assert_eq!(
            ab.active_indices(ContextMode::Conjunctive),
            ba.active_indices(ContextMode::Conjunctive)
        );
    }

    #[test]
    fn every_pair_and_variant_has_a_distinct_code() {
        let mut seen = std::collections::HashSet::new();
        for a in 0..CONTEXT_LETTERS {
            for b in (a + 1)..CONTEXT_LETTERS {
                for v in 0..CONTEXT_VARIANTS {
                    let code = format!(
                        "{}{}{}",
                        (b'A' + a as u8) as char,
                        (b'A' + b as u8) as char,
                        if v == 0 { String::new() } else { format!("_{}", v) }
                    );
                    let ctx = ContextCode::parse(&code).unwrap();
                    let joint = ctx.active_indices(ContextMode::Conjunctive)[0];
                    assert!(joint < CONTEXT_DIM);
                    assert!(seen.insert(joint), "duplicate joint code for {}", code);
                }
            }
        }
        assert_eq!(seen.len(), CONTEXT_PAIRS * CONTEXT_VARIANTS);
    }

    #[test]
    fn sub_context_swaps_component_codes() {
        let base = ContextCode::parse("AB").unwrap();
        let ext = ContextCode::parse("AB_2").unwrap();
        let base_codes = base.active_indices(ContextMode::Elemental);
        let ext_codes = ext.active_indices(ContextMode::Elemental);
        assert_eq!(ext.variant(), 2);
        assert!(base_codes.iter().all(|c| !ext_codes.contains(c)));
        assert!(matches!(
            ContextCode::parse("AB_9"),
            Err(CodeError::SubContext { .. })
        ));
    }

    #[test]
    fn us_indices_are_bounded() {
        assert_eq!(pv_index(Valence::Negative, 0).unwrap(), US_TYPES);
        assert!(pv_index(Valence::Positive, US_TYPES).is_err());
        let last = us_time_index(Valence::Negative, US_TYPES - 1, MAX_ALPHA_TICKS - 1).unwrap();
        assert_eq!(last, US_TIME_DIM - 1);
        assert!(us_time_index(Valence::Positive, 0, MAX_ALPHA_TICKS).is_err());
    }

    #[test]
    fn sparse_code_set_replaces_and_densifies() {
        let mut code = SparseCode::new(4);
        code.set(1, 0.5);
        code.set(1, 1.0);
        code.set(3, 0.25);
        assert_eq!(code.active_count(), 2);
        assert_eq!(code.to_dense(), vec![0.0, 1.0, 0.0, 0.25]);
        assert!(code.is_active(3));
        assert_eq!(code.value(0), 0.0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn dense_copy_drops_out_of_range_indices() {
        let code: SparseCode =
            serde_json::from_str(r#"{"dim":3,"active":[[1,0.5],[7,1.0]]}"#).unwrap();
        assert_eq!(code.to_dense(), vec![0.0, 0.5, 0.0]);
    }
}
