use crate::codes::Valence;
use crate::schedule::{Catalog, CatalogDocument, CatalogError, Condition, RunSequence, TrialBlockTemplate, NULL_STEP};

/// Run that acquires in context A, extinguishes in B and tests back in A.
pub const RENEWAL_RUN: &str = "ABA_Renewal";
pub const PARTIAL_RUN: &str = "Partial";

fn template(block: &str, trial: &str, cs: &str, context: &str, us_prob: f64) -> TrialBlockTemplate {
    TrialBlockTemplate {
        block_name: block.to_string(),
        trial_name: trial.to_string(),
        cs: cs.to_string(),
        context: context.to_string(),
        valence: Valence::Positive,
        us_prob,
        alpha_ticks: 5,
        cs_time_start: 1,
        cs_time_end: 3,
        us_time_start: 3,
        us_time_end: 3,
        ..Default::default()
    }
}

fn condition(name: &str, block: &str, n_iters: usize, blocks_per_iter: usize) -> Condition {
    Condition {
        name: name.to_string(),
        trial_block: block.to_string(),
        n_iters,
        blocks_per_iter,
        ..Default::default()
    }
}

pub fn builtin_document() -> CatalogDocument {
    let mut probe = template("RenewProbe", "A_test", "A", "A", 0.0);
    probe.test_only = true;

    let mut partial_b = template("PartialAcq", "B", "B", "C", 0.5);
    partial_b.percent_of_total = 2.0;
    let partial_c = template("PartialAcq", "C", "C", "C", 1.0);

    let mut compound = template("Overshadow", "AB", "AB", "D", 1.0);
    compound.cs2_time_start = 2;
    compound.cs2_time_end = 3;

    CatalogDocument {
        trial_blocks: vec![
            template("PosAcq", "A", "A", "A", 1.0),
            template("PosExtB", "A_NR", "A", "B", 0.0),
            probe,
            partial_b,
            partial_c,
            compound,
        ],
        conditions: vec![
            condition("Acq", "PosAcq", 5, 10),
            condition("ExtB", "PosExtB", 5, 10),
            condition("RenewA", "RenewProbe", 1, 4),
            condition("PartialAcq", "PartialAcq", 2, 12),
            condition("Overshadow", "Overshadow", 3, 10),
        ],
        runs: vec![
            RunSequence {
                name: RENEWAL_RUN.to_string(),
                steps: vec![
                    "Acq".to_string(),
                    "ExtB".to_string(),
                    "RenewA".to_string(),
                    NULL_STEP.to_string(),
                ],
            },
            RunSequence {
                name: PARTIAL_RUN.to_string(),
                steps: vec!["PartialAcq".to_string()],
            },
            RunSequence {
                name: "Overshadow".to_string(),
                steps: vec!["Overshadow".to_string()],
            },
        ],
    }
}

/// A small acquisition / extinction / renewal catalog for demos and the
/// daemon's fallback.
pub fn builtin_catalog() -> Result<Catalog, CatalogError> {
    Catalog::from_document(builtin_document())
}
