//! Coverage gate rules engine.
//!
//! Evaluates an [`ArtifactRecord`] against a [`CoverageGate`] to produce a
//! [`GateDecision`]. Rejection is an expected outcome, not an error. The
//! gate is pure: no I/O, no suspension.
//!
//! Only an [`ApprovedArtifact`] can be committed to the revision ledger, and
//! the only way to obtain one is through [`CoverageGate::evaluate`].

use aclctl_state::ArtifactRecord;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Gate rules
// ---------------------------------------------------------------------------

/// A single rule that can block an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateRule {
    /// Coverage score must meet or exceed `CoverageGate::min_coverage`.
    MinCoverage,
    /// The named term must be exercised by at least one passing test.
    RequireTerm { term: String },
}

/// Threshold plus the rules evaluated against every artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageGate {
    /// Percentage 0–100. Zero or below disables the gate entirely.
    pub min_coverage: f64,
    pub rules: Vec<GateRule>,
    /// Stop at the first violation.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for CoverageGate {
    fn default() -> Self {
        Self::standard(0.0)
    }
}

impl CoverageGate {
    /// Gate with only the `MinCoverage` rule.
    pub fn standard(min_coverage: f64) -> Self {
        Self {
            min_coverage,
            rules: vec![GateRule::MinCoverage],
            fail_fast: false,
        }
    }

    /// Add a rule.
    pub fn with_rule(mut self, rule: GateRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.min_coverage <= 0.0
    }

    /// Approve or reject `artifact`.
    pub fn evaluate(&self, artifact: &ArtifactRecord) -> GateDecision {
        let verdict = evaluate_gate(self, artifact);
        if verdict.passed() {
            GateDecision::Approved(ApprovedArtifact {
                artifact: artifact.clone(),
            })
        } else {
            GateDecision::Rejected {
                reason: verdict.reason(),
                violations: verdict.violations,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// A single rule violation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub rule: GateRule,
    pub reason: String,
}

/// Violations found by [`evaluate_gate`] (empty when passed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateVerdict {
    pub violations: Vec<Violation>,
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// All violation reasons joined for display.
    pub fn reason(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// An artifact that passed the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovedArtifact {
    artifact: ArtifactRecord,
}

impl ApprovedArtifact {
    pub fn artifact(&self) -> &ArtifactRecord {
        &self.artifact
    }

    pub fn into_inner(self) -> ArtifactRecord {
        self.artifact
    }

    /// Re-admit an artifact that was approved and deployed before, for
    /// rollback. Only the ledger calls this, after checking the history.
    pub(crate) fn reapproved(artifact: ArtifactRecord) -> Self {
        Self { artifact }
    }
}

/// Outcome of [`CoverageGate::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Approved(ApprovedArtifact),
    Rejected {
        reason: String,
        violations: Vec<Violation>,
    },
}

impl GateDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, GateDecision::Approved(_))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Evaluate `artifact` against every rule of `gate`.
///
/// A disabled gate (threshold 0) passes everything.
pub fn evaluate_gate(gate: &CoverageGate, artifact: &ArtifactRecord) -> GateVerdict {
    if gate.is_disabled() {
        return GateVerdict {
            violations: Vec::new(),
        };
    }

    let mut violations = Vec::new();
    for rule in &gate.rules {
        if let Some(v) = check_rule(rule, gate, artifact) {
            violations.push(v);
            if gate.fail_fast {
                break;
            }
        }
    }
    GateVerdict { violations }
}

fn check_rule(rule: &GateRule, gate: &CoverageGate, artifact: &ArtifactRecord) -> Option<Violation> {
    match rule {
        GateRule::MinCoverage => {
            if artifact.coverage_score < gate.min_coverage {
                let mut reason = format!(
                    "coverage {:.1}% below minimum {:.1}%",
                    artifact.coverage_score, gate.min_coverage
                );
                if !artifact.uncovered_terms.is_empty() {
                    reason.push_str(&format!(
                        " (uncovered: {})",
                        artifact.uncovered_terms.join(", ")
                    ));
                }
                Some(Violation {
                    rule: rule.clone(),
                    reason,
                })
            } else {
                None
            }
        }
        GateRule::RequireTerm { term } => {
            if artifact.uncovered_terms.iter().any(|t| t == term) {
                Some(Violation {
                    rule: rule.clone(),
                    reason: format!("required term '{term}' is not covered by any test"),
                })
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aclctl_state::{ContentDigest, PolicyIdentity};
    use chrono::Utc;

    fn artifact(score: f64, uncovered: &[&str]) -> ArtifactRecord {
        ArtifactRecord {
            fingerprint: ContentDigest::from_bytes(b"p"),
            policy: PolicyIdentity::new("edge-in", "juniper"),
            filter_name: "edge-in".into(),
            config_text: "firewall {}".into(),
            diagnostics: vec![],
            coverage_score: score,
            uncovered_terms: uncovered.iter().map(|s| s.to_string()).collect(),
            compiled_at: Utc::now(),
        }
    }

    #[test]
    fn test_threshold_zero_approves_everything() {
        let gate = CoverageGate::standard(0.0).with_rule(GateRule::RequireTerm {
            term: "deny-all".into(),
        });
        assert!(gate.evaluate(&artifact(0.0, &["deny-all"])).is_approved());
    }

    #[test]
    fn test_threshold_100_rejects_anything_less() {
        let gate = CoverageGate::standard(100.0);
        assert!(!gate.evaluate(&artifact(99.9, &[])).is_approved());
        assert!(gate.evaluate(&artifact(100.0, &[])).is_approved());
    }

    #[test]
    fn test_rejection_reason_lists_uncovered_terms() {
        let gate = CoverageGate::standard(95.0);
        match gate.evaluate(&artifact(90.0, &["allow-web"])) {
            GateDecision::Rejected { reason, violations } => {
                assert!(reason.contains("90.0%"));
                assert!(reason.contains("allow-web"));
                assert_eq!(violations.len(), 1);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_require_term_and_fail_fast() {
        let gate = CoverageGate::standard(80.0).with_rule(GateRule::RequireTerm {
            term: "deny-all".into(),
        });
        let a = artifact(50.0, &["deny-all"]);
        assert_eq!(evaluate_gate(&gate, &a).violations.len(), 2);

        let gate = gate.with_fail_fast(true);
        let verdict = evaluate_gate(&gate, &a);
        assert_eq!(verdict.violations.len(), 1);
        assert_eq!(verdict.violations[0].rule, GateRule::MinCoverage);
    }

    #[test]
    fn test_require_term_alone_can_reject() {
        let gate = CoverageGate::standard(10.0).with_rule(GateRule::RequireTerm {
            term: "allow-ssh".into(),
        });
        assert!(!gate.evaluate(&artifact(90.0, &["allow-ssh"])).is_approved());
        assert!(gate.evaluate(&artifact(90.0, &["log-rest"])).is_approved());
    }

    #[test]
    fn test_gate_rule_serde_tag() {
        let json = serde_json::to_value(GateRule::RequireTerm { term: "x".into() }).unwrap();
        assert_eq!(json["type"], "require_term");
    }
}
