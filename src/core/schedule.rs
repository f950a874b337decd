//! Declarative experiment records and the validated catalog that holds them.
//!
//! A [`RunSequence`] names up to five [`Condition`]s; each condition names a
//! set of [`TrialBlockTemplate`]s (grouped by `block_name`). The catalog
//! refuses to exist unless every reference resolves and every template is
//! internally consistent.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::codes::{ContextCode, ContextMode, StimulusCode, Valence, MAX_ALPHA_TICKS, US_TYPES};

/// Sentinel step name that ends a run early.
pub const NULL_STEP: &str = "NullStep";
pub const MAX_RUN_STEPS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrialBlockTemplate {
    /// Template set this archetype belongs to.
    pub block_name: String,
    pub trial_name: String,
    pub percent_of_total: f64,
    pub cs: String,
    pub context: String,
    pub valence: Valence,
    pub us_index: usize,
    pub us_magnitude: f32,
    pub us_prob: f64,
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

impl Default for TrialBlockTemplate {
    fn default() -> Self {
        Self {
            block_name: String::new(),
            trial_name: String::new(),
            percent_of_total: 1.0,
            cs: "A".to_string(),
            context: "A".to_string(),
            valence: Valence::Positive,
            us_index: 0,
            us_magnitude: 1.0,
            us_prob: 1.0,
            alpha_ticks: 5,
            cs_time_start: 1,
            cs_time_end: 3,
            cs2_time_start: 1,
            cs2_time_end: 3,
            us_time_start: 3,
            us_time_end: 3,
            mixed_us: false,
            test_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Condition {
    pub name: String,
    /// Template set (`block_name`) this condition draws from.
    pub trial_block: String,
    /// Trial-blocks per condition.
    pub n_iters: usize,
    /// Trials generated per trial-block.
    pub blocks_per_iter: usize,
    /// Realize `us_prob` as exact omission counts instead of sampling.
    pub fixed_prob: bool,
    pub permute: bool,
    /// Save weights every N completed trial-blocks; 0 disables.
    pub save_wts_interval: usize,
    pub context_mode: ContextMode,
}

impl Default for Condition {
    fn default() -> Self {
        Self {
            name: String::new(),
            trial_block: String::new(),
            n_iters: 1,
            blocks_per_iter: 10,
            fixed_prob: true,
            permute: true,
            save_wts_interval: 0,
            context_mode: ContextMode::Elemental,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RunSequence {
    pub name: String,
    pub steps: Vec<String>,
}

impl RunSequence {
    /// Condition names in execution order, stopping at the `NullStep` sentinel.
    pub fn conditions(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .map(String::as_str)
            .take_while(|s| *s != NULL_STEP)
    }
}

/// One referential-integrity or consistency problem found while loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    UnknownCondition { run: String, condition: String },
    UnknownTrialBlock { condition: String, trial_block: String },
    RunTooLong { run: String, steps: usize },
    Duplicate { kind: &'static str, name: String },
    EmptyTrialBlock { trial_block: String },
    ZeroCount { condition: String, field: &'static str },
    Template { trial: String, problem: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::UnknownCondition { run, condition } => {
                write!(f, "run {:?} references unknown condition {:?}", run, condition)
            }
            Violation::UnknownTrialBlock {
                condition,
                trial_block,
            } => write!(
                f,
                "condition {:?} references unknown trial block {:?}",
                condition, trial_block
            ),
            Violation::RunTooLong { run, steps } => write!(
                f,
                "run {:?} has {} steps (max {})",
                run, steps, MAX_RUN_STEPS
            ),
            Violation::Duplicate { kind, name } => write!(f, "duplicate {} name {:?}", kind, name),
            Violation::EmptyTrialBlock { trial_block } => {
                write!(f, "trial block {:?} has no templates", trial_block)
            }
            Violation::ZeroCount { condition, field } => {
                write!(f, "condition {:?} has {} = 0", condition, field)
            }
            Violation::Template { trial, problem } => write!(f, "template {:?}: {}", trial, problem),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(pub Vec<Violation>);

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation(s)", self.0.len())?;
        for v in &self.0 {
            write!(f, "\n  - {}", v)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog failed validation: {0}")]
    Invalid(Violations),
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serde")]
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

impl CatalogError {
    pub fn violations(&self) -> &[Violation] {
        match self {
            CatalogError::Invalid(v) => &v.0,
            _ => &[],
        }
    }
}

/// Serialized form of a catalog: flat lists, grouped on load.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CatalogDocument {
    pub trial_blocks: Vec<TrialBlockTemplate>,
    pub conditions: Vec<Condition>,
    pub runs: Vec<RunSequence>,
}

/// Read-only, validated lookup of templates, conditions and runs.
#[derive(Debug, Clone)]
pub struct Catalog {
    trial_blocks: BTreeMap<String, Vec<TrialBlockTemplate>>,
    conditions: BTreeMap<String, Condition>,
    runs: BTreeMap<String, RunSequence>,
}

impl Catalog {
    pub fn new(
        templates: Vec<TrialBlockTemplate>,
        conditions: Vec<Condition>,
        runs: Vec<RunSequence>,
    ) -> Result<Self, CatalogError> {
        Self::from_document(CatalogDocument {
            trial_blocks: templates,
            conditions,
            runs,
        })
    }

    pub fn from_document(doc: CatalogDocument) -> Result<Self, CatalogError> {
        let mut violations = Vec::new();

        let mut trial_blocks: BTreeMap<String, Vec<TrialBlockTemplate>> = BTreeMap::new();
        for t in doc.trial_blocks {
            check_template(&t, &mut violations);
            let set = trial_blocks.entry(t.block_name.clone()).or_default();
            if set.iter().any(|o| o.trial_name == t.trial_name) {
                violations.push(Violation::Duplicate {
                    kind: "trial",
                    name: format!("{}/{}", t.block_name, t.trial_name),
                });
            }
            set.push(t);
        }

        let mut conditions = BTreeMap::new();
        for c in doc.conditions {
            for (field, n) in [("n_iters", c.n_iters), ("blocks_per_iter", c.blocks_per_iter)] {
                if n == 0 {
                    violations.push(Violation::ZeroCount {
                        condition: c.name.clone(),
                        field,
                    });
                }
            }
            match trial_blocks.get(&c.trial_block) {
                None => violations.push(Violation::UnknownTrialBlock {
                    condition: c.name.clone(),
                    trial_block: c.trial_block.clone(),
                }),
                Some(set) if set.iter().all(|t| t.percent_of_total <= 0.0) => {
                    violations.push(Violation::EmptyTrialBlock {
                        trial_block: c.trial_block.clone(),
                    })
                }
                Some(_) => {}
            }
            if conditions.contains_key(&c.name) {
                violations.push(Violation::Duplicate {
                    kind: "condition",
                    name: c.name.clone(),
                });
            }
            conditions.insert(c.name.clone(), c);
        }

        let mut runs = BTreeMap::new();
        for r in doc.runs {
            if r.steps.len() > MAX_RUN_STEPS {
                violations.push(Violation::RunTooLong {
                    run: r.name.clone(),
                    steps: r.steps.len(),
                });
            }
            for step in r.conditions() {
                if !conditions.contains_key(step) {
                    violations.push(Violation::UnknownCondition {
                        run: r.name.clone(),
                        condition: step.to_string(),
                    });
                }
            }
            if runs.contains_key(&r.name) {
                violations.push(Violation::Duplicate {
                    kind: "run",
                    name: r.name.clone(),
                });
            }
            runs.insert(r.name.clone(), r);
        }

        if !violations.is_empty() {
            return Err(CatalogError::Invalid(Violations(violations)));
        }

        Ok(Self {
            trial_blocks,
            conditions,
            runs,
        })
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(s: &str) -> Result<Self, CatalogError> {
        let doc: CatalogDocument = serde_json::from_str(s)?;
        Self::from_document(doc)
    }

    #[cfg(feature = "serde")]
    pub fn from_reader<R: std::io::Read>(r: R) -> Result<Self, CatalogError> {
        let doc: CatalogDocument = serde_json::from_reader(r)?;
        Self::from_document(doc)
    }

    #[cfg(feature = "serde")]
    pub fn load(path: &std::path::Path) -> Result<Self, CatalogError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn to_document(&self) -> CatalogDocument {
        CatalogDocument {
            trial_blocks: self.trial_blocks.values().flatten().cloned().collect(),
            conditions: self.conditions.values().cloned().collect(),
            runs: self.runs.values().cloned().collect(),
        }
    }

    pub fn templates(&self, trial_block: &str) -> Option<&[TrialBlockTemplate]> {
        self.trial_blocks.get(trial_block).map(Vec::as_slice)
    }

    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.get(name)
    }

    pub fn run(&self, name: &str) -> Option<&RunSequence> {
        self.runs.get(name)
    }

    pub fn run_names(&self) -> impl Iterator<Item = &str> {
        self.runs.keys().map(String::as_str)
    }

    pub fn condition_names(&self) -> impl Iterator<Item = &str> {
        self.conditions.keys().map(String::as_str)
    }

    /// Templates for a condition. Validation guarantees the set exists.
    pub fn templates_for(&self, condition: &Condition) -> &[TrialBlockTemplate] {
        self.templates(&condition.trial_block).unwrap_or(&[])
    }
}

fn check_template(t: &TrialBlockTemplate, out: &mut Vec<Violation>) {
    let mut problem = |p: String| {
        out.push(Violation::Template {
            trial: format!("{}/{}", t.block_name, t.trial_name),
            problem: p,
        })
    };

    if t.alpha_ticks == 0 || t.alpha_ticks > MAX_ALPHA_TICKS {
        problem(format!(
            "alpha_ticks {} outside 1..={}",
            t.alpha_ticks, MAX_ALPHA_TICKS
        ));
    }
    if !(0.0..=1.0).contains(&t.us_prob) {
        problem(format!("us_prob {} outside [0, 1]", t.us_prob));
    }
    if t.percent_of_total < 0.0 || !t.percent_of_total.is_finite() {
        problem(format!("percent_of_total {} is negative", t.percent_of_total));
    }
    if t.us_index >= US_TYPES {
        problem(format!("us_index {} outside 0..{}", t.us_index, US_TYPES));
    }

    let compound = match StimulusCode::parse(&t.cs) {
        Ok(cs) => cs.is_compound(),
        Err(e) => {
            problem(e.to_string());
            false
        }
    };
    if let Err(e) = ContextCode::parse(&t.context) {
        problem(e.to_string());
    }

    let mut windows = vec![
        ("cs", t.cs_time_start, t.cs_time_end),
        ("us", t.us_time_start, t.us_time_end),
    ];
    if compound {
        windows.push(("cs2", t.cs2_time_start, t.cs2_time_end));
    }
    for (label, start, end) in windows {
        if start > end {
            problem(format!("{}_time_start {} > {}_time_end {}", label, start, label, end));
        }
        if end >= t.alpha_ticks {
            problem(format!(
                "{}_time_end {} beyond alpha_ticks {}",
                label, end, t.alpha_ticks
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acq_template() -> TrialBlockTemplate {
        TrialBlockTemplate {
            block_name: "PosAcq".to_string(),
            trial_name: "A_Rf".to_string(),
            ..Default::default()
        }
    }

    fn acq_condition() -> Condition {
        Condition {
            name: "Acq".to_string(),
            trial_block: "PosAcq".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn valid_catalog_loads() {
        let cat = Catalog::new(
            vec![acq_template()],
            vec![acq_condition()],
            vec![RunSequence {
                name: "Run".to_string(),
                steps: vec!["Acq".to_string()],
            }],
        )
        .unwrap();
        assert_eq!(cat.templates("PosAcq").unwrap().len(), 1);
        assert!(cat.condition("Acq").is_some());
        assert_eq!(cat.run("Run").unwrap().conditions().count(), 1);
    }

    #[test]
    fn null_step_terminates_run() {
        let run = RunSequence {
            name: "R".to_string(),
            steps: vec![
                "Acq".to_string(),
                NULL_STEP.to_string(),
                "Missing".to_string(),
            ],
        };
        assert_eq!(run.conditions().collect::<Vec<_>>(), vec!["Acq"]);

        // Names after the sentinel are never executed, so they are not checked.
        assert!(Catalog::new(vec![acq_template()], vec![acq_condition()], vec![run]).is_ok());
    }

    #[test]
    fn reports_every_violation_not_just_the_first() {
        let mut bad = acq_template();
        bad.cs_time_start = 4;
        bad.cs_time_end = 2;
        bad.us_prob = 1.5;

        let orphan = Condition {
            name: "Orphan".to_string(),
            trial_block: "Nope".to_string(),
            ..Default::default()
        };
        let run = RunSequence {
            name: "Run".to_string(),
            steps: vec!["Acq".to_string(), "Ghost".to_string()],
        };

        let err = Catalog::new(vec![bad], vec![acq_condition(), orphan], vec![run]).unwrap_err();
        let v = err.violations();
        assert!(v.len() >= 4, "expected all violations, got {:?}", v);
        assert!(v.iter().any(|x| matches!(x, Violation::UnknownTrialBlock { .. })));
        assert!(v
            .iter()
            .any(|x| matches!(x, Violation::UnknownCondition { condition, .. } if condition == "Ghost")));
        assert!(v
            .iter()
            .any(|x| matches!(x, Violation::Template { problem, .. } if problem.contains("cs_time_start"))));
        assert!(v
            .iter()
            .any(|x| matches!(x, Violation::Template { problem, .. } if problem.contains("us_prob"))));

        let msg = err.to_string();
        assert!(msg.contains("Ghost") && msg.contains("Nope"), "{}", msg);
    }

    #[test]
    fn cs2_window_checked_only_for_compounds() {
        let mut single = acq_template();
        single.cs2_time_start = 4;
        single.cs2_time_end = 0;
        assert!(Catalog::new(vec![single.clone()], vec![], vec![]).is_ok());

        single.cs = "AB".to_string();
        let err = Catalog::new(vec![single], vec![], vec![]).unwrap_err();
        assert!(err.to_string().contains("cs2_time_start"));
    }

    #[test]
    fn run_longer_than_five_steps_is_rejected() {
        let run = RunSequence {
            name: "Long".to_string(),
            steps: vec!["Acq".to_string(); 6],
        };
        let err = Catalog::new(vec![acq_template()], vec![acq_condition()], vec![run]).unwrap_err();
        assert!(err
            .violations()
            .iter()
            .any(|v| matches!(v, Violation::RunTooLong { steps: 6, .. })));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_document_roundtrip() {
        let json = r#"{
            "trial_blocks": [
                { "block_name": "PosAcq", "trial_name": "A_Rf", "cs": "A", "context": "AB",
                  "us_prob": 1.0, "alpha_ticks": 4, "cs_time_start": 1, "cs_time_end": 2,
                  "us_time_start": 2, "us_time_end": 2 }
            ],
            "conditions": [
                { "name": "Acq", "trial_block": "PosAcq", "blocks_per_iter": 5,
                  "context_mode": "both" }
            ],
            "runs": [ { "name": "Run", "steps": ["Acq", "NullStep"] } ]
        }"#;
        let cat = Catalog::from_json_str(json).unwrap();
        let cond = cat.condition("Acq").unwrap();
        assert_eq!(cond.blocks_per_iter, 5);
        assert_eq!(cond.context_mode, ContextMode::Both);

        let doc = serde_json::to_string(&cat.to_document()).unwrap();
        let again = Catalog::from_json_str(&doc).unwrap();
        assert_eq!(again.templates("PosAcq"), cat.templates("PosAcq"));
    }
}
