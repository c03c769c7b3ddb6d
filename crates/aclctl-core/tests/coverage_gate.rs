use std::sync::Arc;

use aclctl_core::compiler::CompilerAdapter;
use aclctl_core::gate::{CoverageGate, GateDecision, GateRule};
use aclctl_core::testing::{sample_policy, StaticCompiler};
use aclctl_state::fakes::MemoryArtifactCache;
use aclctl_state::ArtifactRecord;

async fn compile_with(compiler: StaticCompiler) -> ArtifactRecord {
    let adapter = CompilerAdapter::new(Arc::new(compiler), Arc::new(MemoryArtifactCache::new()));
    adapter
        .compile(&sample_policy("edge-in", "juniper"))
        .await
        .expect("compile")
        .artifact
}

#[tokio::test]
async fn matched_terms_drive_the_score() {
    let artifact = compile_with(StaticCompiler::with_matched_terms(&["allow-ssh"])).await;

    assert_eq!(artifact.coverage_score, 50.0);
    assert_eq!(artifact.uncovered_terms, vec!["deny-all".to_string()]);
}

#[tokio::test]
async fn reported_score_is_clamped() {
    let artifact = compile_with(StaticCompiler::new(140.0)).await;
    assert_eq!(artifact.coverage_score, 100.0);

    let artifact = compile_with(StaticCompiler::new(-3.0)).await;
    assert_eq!(artifact.coverage_score, 0.0);
}

#[tokio::test]
async fn threshold_is_inclusive() {
    let artifact = compile_with(StaticCompiler::new(80.0)).await;

    assert!(CoverageGate::standard(80.0).evaluate(&artifact).is_approved());
    assert!(!CoverageGate::standard(80.1).evaluate(&artifact).is_approved());
}

#[tokio::test]
async fn full_threshold_needs_full_coverage() {
    let gate = CoverageGate::standard(100.0);

    let partial = compile_with(StaticCompiler::new(99.9)).await;
    assert!(!gate.evaluate(&partial).is_approved());

    let full = compile_with(StaticCompiler::new(100.0)).await;
    assert!(gate.evaluate(&full).is_approved());
}

#[tokio::test]
async fn rejection_names_uncovered_terms() {
    let artifact = compile_with(StaticCompiler::with_matched_terms(&["allow-ssh"])).await;

    match CoverageGate::standard(60.0).evaluate(&artifact) {
        GateDecision::Rejected { reason, violations } => {
            assert_eq!(violations.len(), 1);
            assert!(reason.contains("50.0%"), "reason: {reason}");
            assert!(reason.contains("deny-all"), "reason: {reason}");
        }
        GateDecision::Approved(_) => panic!("coverage 50 must not pass 60"),
    }
}

#[tokio::test]
async fn required_term_blocks_even_above_threshold() {
    let artifact = compile_with(StaticCompiler::with_matched_terms(&["allow-ssh"])).await;
    let gate = CoverageGate::standard(10.0).with_rule(GateRule::RequireTerm {
        term: "deny-all".to_string(),
    });

    let decision = gate.evaluate(&artifact);
    assert!(!decision.is_approved());

    let gate = CoverageGate::standard(10.0).with_rule(GateRule::RequireTerm {
        term: "allow-ssh".to_string(),
    });
    assert!(gate.evaluate(&artifact).is_approved());
}

#[tokio::test]
async fn zero_threshold_disables_every_rule() {
    let artifact = compile_with(StaticCompiler::new(0.0)).await;
    let gate = CoverageGate::standard(0.0).with_rule(GateRule::RequireTerm {
        term: "deny-all".to_string(),
    });

    match gate.evaluate(&artifact) {
        GateDecision::Approved(approved) => {
            assert_eq!(approved.artifact().fingerprint, artifact.fingerprint)
        }
        GateDecision::Rejected { reason, .. } => panic!("disabled gate rejected: {reason}"),
    }
}
