use std::sync::Arc;

use aclctl_core::compiler::CompilerAdapter;
use aclctl_core::domain::error::AclError;
use aclctl_core::gate::{ApprovedArtifact, CoverageGate, GateDecision};
use aclctl_core::ledger::RevisionLedger;
use aclctl_core::testing::{sample_policy, StaticCompiler};
use aclctl_core::{Action, Policy, Term};
use aclctl_state::fakes::{MemoryArtifactCache, MemoryRevisionStore};
use aclctl_state::{DeviceId, PolicyIdentity, RevisionStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    ledger: RevisionLedger,
    compiler: CompilerAdapter,
}

fn fixture() -> Fixture {
    let artifacts = Arc::new(MemoryArtifactCache::new());
    Fixture {
        ledger: RevisionLedger::new(Arc::new(MemoryRevisionStore::new()), artifacts.clone()),
        compiler: CompilerAdapter::new(Arc::new(StaticCompiler::new(100.0)), artifacts),
    }
}

impl Fixture {
    async fn approve(&self, policy: &Policy) -> ApprovedArtifact {
        let artifact = self.compiler.compile(policy).await.expect("compile").artifact;
        match CoverageGate::standard(50.0).evaluate(&artifact) {
            GateDecision::Approved(approved) => approved,
            GateDecision::Rejected { reason, .. } => panic!("rejected: {reason}"),
        }
    }
}

fn identity() -> PolicyIdentity {
    PolicyIdentity::new("edge-in", "juniper")
}

fn widened() -> Policy {
    let mut policy = sample_policy("edge-in", "juniper");
    let mut https = Term::new("allow-https", Action::Accept);
    https.destination_services = vec!["https".to_string()];
    policy.terms.insert(1, https);
    policy
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_commit_gets_seq_one_and_is_approved() {
    let fx = fixture();
    let approved = fx.approve(&sample_policy("edge-in", "juniper")).await;

    let rev = fx
        .ledger
        .commit(&DeviceId::from("r1"), &identity(), &approved)
        .await
        .expect("commit");

    assert_eq!(rev.seq, 1);
    assert_eq!(rev.status, RevisionStatus::Approved);
    assert_eq!(rev.fingerprint, approved.artifact().fingerprint);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commits_produce_gapless_sequence() {
    let fx = Arc::new(fixture());
    let approved = fx.approve(&sample_policy("edge-in", "juniper")).await;
    let device = DeviceId::from("r1");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let fx = fx.clone();
        let approved = approved.clone();
        let device = device.clone();
        handles.push(tokio::spawn(async move {
            fx.ledger.commit(&device, &identity(), &approved).await
        }));
    }
    let mut seqs = Vec::new();
    for handle in handles {
        seqs.push(handle.await.expect("join").expect("commit").seq);
    }
    seqs.sort_unstable();

    assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    let history = fx.ledger.history(&device, &identity()).await.expect("history");
    assert_eq!(history.len(), 10);
    assert_eq!(history[0].seq, 10);
}

#[tokio::test]
async fn stale_expected_seq_is_a_conflict() {
    let fx = fixture();
    let approved = fx.approve(&sample_policy("edge-in", "juniper")).await;
    let device = DeviceId::from("r1");

    fx.ledger
        .commit_expecting(&device, &identity(), &approved, 0)
        .await
        .expect("first");
    let err = fx
        .ledger
        .commit_expecting(&device, &identity(), &approved, 0)
        .await
        .expect_err("stale");

    assert!(matches!(err, AclError::Conflict(_)));
    assert!(err.is_conflict());
}

#[tokio::test]
async fn sequences_are_independent_per_device() {
    let fx = fixture();
    let approved = fx.approve(&sample_policy("edge-in", "juniper")).await;

    let a = fx
        .ledger
        .commit(&DeviceId::from("r1"), &identity(), &approved)
        .await
        .expect("r1");
    let b = fx
        .ledger
        .commit(&DeviceId::from("r2"), &identity(), &approved)
        .await
        .expect("r2");

    assert_eq!((a.seq, b.seq), (1, 1));
}

#[tokio::test]
async fn artifact_for_another_policy_is_refused() {
    let fx = fixture();
    let approved = fx.approve(&sample_policy("core-out", "juniper")).await;

    let err = fx
        .ledger
        .commit(&DeviceId::from("r1"), &identity(), &approved)
        .await
        .expect_err("mismatched policy");
    assert!(matches!(err, AclError::InvalidPolicy(_)));
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_marks_are_idempotent_and_final() {
    let fx = fixture();
    let approved = fx.approve(&sample_policy("edge-in", "juniper")).await;
    let rev = fx
        .ledger
        .commit(&DeviceId::from("r1"), &identity(), &approved)
        .await
        .expect("commit");

    let first = fx.ledger.mark_deployed(&rev.revision_id).await.expect("deploy");
    let again = fx.ledger.mark_deployed(&rev.revision_id).await.expect("again");
    assert_eq!(first.status, RevisionStatus::Deployed);
    assert_eq!(again.status, RevisionStatus::Deployed);

    assert!(fx.ledger.mark_rolled_back(&rev.revision_id).await.is_err());
    let stored = fx.ledger.get(&rev.revision_id).await.expect("get");
    assert_eq!(stored.status, RevisionStatus::Deployed);
}

// ---------------------------------------------------------------------------
// Diff and rollback target
// ---------------------------------------------------------------------------

#[tokio::test]
async fn diff_shows_added_term() {
    let fx = fixture();
    let device = DeviceId::from("r1");
    let v1 = fx.approve(&sample_policy("edge-in", "juniper")).await;
    let v2 = fx.approve(&widened()).await;

    let a = fx.ledger.commit(&device, &identity(), &v1).await.expect("v1");
    let b = fx.ledger.commit(&device, &identity(), &v2).await.expect("v2");

    let diff = fx.ledger.diff(&a.revision_id, &b.revision_id).await.expect("diff");
    assert!(!diff.identical());
    assert_eq!(diff.added(), 1);
    assert_eq!(diff.removed(), 0);
    assert!(diff.render().contains("+  term allow-https"));

    let same = fx.ledger.diff(&a.revision_id, &a.revision_id).await.expect("self diff");
    assert!(same.identical());
}

#[tokio::test]
async fn rollback_target_skips_identical_and_undeployed_revisions() {
    let fx = fixture();
    let device = DeviceId::from("r1");
    let v1 = fx.approve(&sample_policy("edge-in", "juniper")).await;
    let v2 = fx.approve(&widened()).await;

    assert!(fx
        .ledger
        .rollback_target(&device, &identity())
        .await
        .expect("empty")
        .is_none());

    let first = fx.ledger.commit(&device, &identity(), &v1).await.expect("seq 1");
    fx.ledger.mark_deployed(&first.revision_id).await.expect("deploy 1");
    let second = fx.ledger.commit(&device, &identity(), &v2).await.expect("seq 2");
    fx.ledger.mark_deployed(&second.revision_id).await.expect("deploy 2");
    // Same artifact again, then one that never made it.
    let third = fx.ledger.commit(&device, &identity(), &v2).await.expect("seq 3");
    fx.ledger.mark_deployed(&third.revision_id).await.expect("deploy 3");
    let fourth = fx.ledger.commit(&device, &identity(), &v1).await.expect("seq 4");
    fx.ledger.mark_rolled_back(&fourth.revision_id).await.expect("roll back 4");

    let target = fx
        .ledger
        .rollback_target(&device, &identity())
        .await
        .expect("target")
        .expect("some target");
    assert_eq!(target.revision_id, first.revision_id);

    let approved = fx.ledger.reapprove(&target).await.expect("reapprove");
    assert_eq!(approved.artifact().fingerprint, first.fingerprint);
    assert!(fx.ledger.reapprove(&fourth).await.is_err());
}
