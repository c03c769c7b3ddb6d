//! Term coverage derived from test cases.
//!
//! Some compiler back-ends report a coverage score directly; others report
//! which terms were matched by passing test cases. [`score_from_matches`]
//! turns the latter into a 0–100 score plus the list of uncovered terms.

use serde::{Deserialize, Serialize};

/// Coverage of a policy's terms by its test suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    /// Percentage in 0.0–100.0.
    pub score: f64,
    /// Terms no passing test case matched, in policy order.
    pub uncovered_terms: Vec<String>,
}

impl Coverage {
    pub fn full() -> Self {
        Self {
            score: 100.0,
            uncovered_terms: Vec::new(),
        }
    }
}

/// Clamp a back-end reported score into range. NaN counts as zero.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

fn is_covered(term: &str, matched: &[String]) -> bool {
    // Some renderers suffix expanded terms (`allow-ssh-v6`), which still
    // exercise the authored term.
    matched
        .iter()
        .any(|m| m == term || m.starts_with(&format!("{term}-")))
}

/// Score the fraction of `terms` present in `matched`.
///
/// A policy with no terms is trivially covered.
pub fn score_from_matches(terms: &[String], matched: &[String]) -> Coverage {
    if terms.is_empty() {
        return Coverage::full();
    }
    let uncovered_terms: Vec<String> = terms
        .iter()
        .filter(|t| !is_covered(t, matched))
        .cloned()
        .collect();
    let covered = terms.len() - uncovered_terms.len();
    Coverage {
        score: covered as f64 * 100.0 / terms.len() as f64,
        uncovered_terms,
    }
}
