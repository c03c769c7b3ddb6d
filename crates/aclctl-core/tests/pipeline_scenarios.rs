//! End-to-end pipeline runs against in-memory stores and simulated devices.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aclctl_core::coordinator::{Coordinator, CoordinatorSettings, Submission};
use aclctl_core::deploy::{DeployOptions, Verification};
use aclctl_core::domain::error::AclError;
use aclctl_core::gate::CoverageGate;
use aclctl_core::pipeline::{PipelineFailure, PipelineState};
use aclctl_core::retry::RetryPolicy;
use aclctl_core::testing::{
    device, drain, sample_policy, DeviceBehavior, FailingCompiler, FakeNetwork, StaticCompiler,
};
use aclctl_core::{Action, ExternalCompiler, Policy, PolicyCompiler, Term};
use aclctl_state::{
    DeviceId, JobId, JobKind, JobOutcome, JobQueue, JobRecord, JobState, NewJob, NewRevision,
    PolicyIdentity, RevisionId, RevisionRecord, RevisionStatus, RevisionStore, StorageError,
    StorageResult, Stores,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

const BASELINE: &str = "filter legacy {\n  term any Accept;\n}\n";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    coordinator: Arc<Coordinator>,
    net: FakeNetwork,
}

fn settings(min_coverage: f64) -> CoordinatorSettings {
    CoordinatorSettings {
        gate: CoverageGate::standard(min_coverage),
        retry: RetryPolicy {
            base_delay_ms: 0,
            busy_requeue_ms: 10,
            ..RetryPolicy::default()
        },
        deploy: DeployOptions::default(),
    }
}

async fn harness(compiler: Arc<dyn PolicyCompiler>, settings: CoordinatorSettings) -> Harness {
    harness_with(Stores::in_memory(), compiler, settings).await
}

async fn harness_with(
    stores: Stores,
    compiler: Arc<dyn PolicyCompiler>,
    settings: CoordinatorSettings,
) -> Harness {
    let net = FakeNetwork::new();
    let coordinator = Arc::new(Coordinator::new(
        stores,
        compiler,
        Arc::new(net.clone()),
        settings,
    ));
    for id in ["r1", "r2"] {
        coordinator
            .register_device(device(id, "juniper"))
            .await
            .expect("register device");
        net.add_device(id, BASELINE);
    }
    Harness { coordinator, net }
}

impl Harness {
    async fn submit(&self, policy: &Policy, devices: &[&str]) -> Submission {
        self.coordinator.put_policy(policy).await.expect("put policy");
        let devices: Vec<DeviceId> = devices.iter().map(|d| DeviceId::from(*d)).collect();
        self.coordinator
            .submit(&policy.identity(), &devices)
            .await
            .expect("submit")
    }

    async fn state(&self, submission: &Submission, device_id: &str) -> PipelineState {
        let handle = submission
            .pipelines
            .iter()
            .find(|h| h.device_id.as_str() == device_id)
            .expect("pipeline for device");
        self.coordinator
            .pipeline(&handle.pipeline_id)
            .await
            .expect("pipeline")
            .1
    }

    async fn job(&self, submission: &Submission) -> JobRecord {
        self.coordinator
            .stores()
            .jobs
            .get(&submission.job_id)
            .await
            .expect("job")
    }

    async fn deploy_jobs(&self) -> Vec<JobRecord> {
        let mut jobs = self.coordinator.stores().jobs.list(None).await.expect("jobs");
        jobs.retain(|j| j.kind == JobKind::Deploy);
        jobs
    }

    async fn current_revision(&self, device_id: &str) -> Option<aclctl_state::RevisionId> {
        self.coordinator
            .stores()
            .devices
            .get(&DeviceId::from(device_id))
            .await
            .expect("device")
            .current_revision
    }

    async fn run(&self) {
        drain(&self.coordinator, 2).await.expect("drain");
    }
}

/// Job queue that refuses deploy enqueues once `allowed` have gone through.
struct RefusingDeployQueue {
    inner: Arc<dyn JobQueue>,
    allowed: AtomicUsize,
}

#[async_trait]
impl JobQueue for RefusingDeployQueue {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StorageResult<JobRecord> {
        if job.kind == JobKind::Deploy
            && self
                .allowed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            return Err(StorageError::Backend("queue unavailable".to_string()));
        }
        self.inner.enqueue(job, now).await
    }

    async fn claim(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        visibility: chrono::Duration,
    ) -> StorageResult<Option<JobRecord>> {
        self.inner.claim(worker, now, visibility).await
    }

    async fn finish(
        &self,
        claimed: &JobRecord,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<JobRecord> {
        self.inner.finish(claimed, outcome, now).await
    }

    async fn cancel(&self, job_id: &JobId, now: DateTime<Utc>) -> StorageResult<JobRecord> {
        self.inner.cancel(job_id, now).await
    }

    async fn get(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        self.inner.get(job_id).await
    }

    async fn list(&self, state: Option<JobState>) -> StorageResult<Vec<JobRecord>> {
        self.inner.list(state).await
    }

    async fn outstanding(&self) -> StorageResult<usize> {
        self.inner.outstanding().await
    }
}

/// Revision store whose first append fails.
struct FlakyRevisions {
    inner: Arc<dyn RevisionStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl RevisionStore for FlakyRevisions {
    async fn append(
        &self,
        revision: NewRevision,
        expected_prev_seq: u64,
        now: DateTime<Utc>,
    ) -> StorageResult<RevisionRecord> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Backend("ledger unavailable".to_string()));
        }
        self.inner.append(revision, expected_prev_seq, now).await
    }

    async fn latest(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> StorageResult<Option<RevisionRecord>> {
        self.inner.latest(device_id, policy).await
    }

    async fn get(&self, revision_id: &RevisionId) -> StorageResult<RevisionRecord> {
        self.inner.get(revision_id).await
    }

    async fn history(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> StorageResult<Vec<RevisionRecord>> {
        self.inner.history(device_id, policy).await
    }

    async fn transition(
        &self,
        revision_id: &RevisionId,
        to: RevisionStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<RevisionRecord> {
        self.inner.transition(revision_id, to, now).await
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
// Happy path and gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn covered_policy_is_deployed_and_pointer_advances() {
    let h = harness(Arc::new(StaticCompiler::new(90.0)), settings(80.0)).await;
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;

    h.run().await;

    let PipelineState::Deployed { revision_id } = h.state(&submission, "r1").await else {
        panic!("pipeline did not reach deployed");
    };
    let revision = h.coordinator.ledger().get(&revision_id).await.expect("revision");
    assert_eq!(revision.seq, 1);
    assert_eq!(revision.status, RevisionStatus::Deployed);
    assert_eq!(h.current_revision("r1").await, Some(revision_id));
    assert_eq!(h.job(&submission).await.state, JobState::Succeeded);

    let artifact = h.coordinator.ledger().artifact_for(&revision).await.expect("artifact");
    assert_eq!(h.net.running_config("r1"), artifact.config_text);
}

#[tokio::test]
async fn under_covered_policy_is_rejected_without_revision() {
    let h = harness(Arc::new(StaticCompiler::new(90.0)), settings(95.0)).await;
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;

    h.run().await;

    match h.state(&submission, "r1").await {
        PipelineState::Rejected { reason, .. } => assert!(reason.contains("90.0%")),
        other => panic!("expected rejected, got {other:?}"),
    }
    let history = h
        .coordinator
        .ledger()
        .history(&DeviceId::from("r1"), &identity())
        .await
        .expect("history");
    assert!(history.is_empty());
    let job = h.job(&submission).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap_or_default().contains("coverage rejected"));
    assert!(h.deploy_jobs().await.is_empty());
    assert_eq!(h.net.running_config("r1"), BASELINE);
}

#[tokio::test]
async fn compile_failure_ends_pipeline_with_diagnostics() {
    let h = harness(
        Arc::new(FailingCompiler::new("term allow-ssh: unknown service 'sshh'")),
        settings(0.0),
    )
    .await;
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;

    h.run().await;

    match h.state(&submission, "r1").await {
        PipelineState::Failed {
            failure: PipelineFailure::Compilation { diagnostics },
        } => assert_eq!(diagnostics, "term allow-ssh: unknown service 'sshh'"),
        other => panic!("expected compilation failure, got {other:?}"),
    }
    assert_eq!(h.job(&submission).await.state, JobState::Failed);
}

#[tokio::test]
async fn missing_compiler_is_retried_not_blamed_on_the_policy() {
    let mut s = settings(0.0);
    s.retry.max_attempts = 2;
    let h = harness(
        Arc::new(ExternalCompiler::new(vec!["/nonexistent/aclctl-render".to_string()])),
        s,
    )
    .await;
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;

    let build = h
        .coordinator
        .stores()
        .jobs
        .claim("manual", Utc::now(), chrono::Duration::seconds(60))
        .await
        .expect("claim")
        .expect("build job");
    let after_first = h.coordinator.process_job(&build, "manual").await.expect("build");
    assert_eq!(after_first.state, JobState::Queued);
    assert!(after_first
        .last_error
        .unwrap_or_default()
        .contains("compiler unavailable"));
    assert!(matches!(
        h.state(&submission, "r1").await,
        PipelineState::Building { .. }
    ));

    h.run().await;

    assert_eq!(h.job(&submission).await.state, JobState::Dead);
    match h.state(&submission, "r1").await {
        PipelineState::Failed {
            failure: PipelineFailure::Invalid { reason },
        } => assert!(reason.contains("compiler unavailable")),
        other => panic!("expected the build to give up, got {other:?}"),
    }
    assert!(h.deploy_jobs().await.is_empty());
}

// ---------------------------------------------------------------------------
// Deploy failures and retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verification_failure_rolls_back_and_fails_pipeline() {
    let mut s = settings(80.0);
    s.deploy.verification = Verification::CheckCommand {
        command: "show firewall log".to_string(),
        must_contain: None,
        must_not_match: Some("error".to_string()),
    };
    let h = harness(Arc::new(StaticCompiler::new(90.0)), s).await;
    h.net.set_behavior(
        "r1",
        DeviceBehavior {
            check_output: Some("commit error: term allow-ssh".to_string()),
            ..Default::default()
        },
    );
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;

    h.run().await;

    let revision_id = match h.state(&submission, "r1").await {
        PipelineState::Failed {
            failure: PipelineFailure::Verification { revision_id, .. },
        } => revision_id,
        other => panic!("expected verification failure, got {other:?}"),
    };
    let revision = h.coordinator.ledger().get(&revision_id).await.expect("revision");
    assert_eq!(revision.status, RevisionStatus::RolledBack);
    assert_eq!(h.net.running_config("r1"), BASELINE);
    assert_eq!(h.current_revision("r1").await, None);

    let deploys = h.deploy_jobs().await;
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0].state, JobState::Failed);
    assert_eq!(deploys[0].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn transient_timeouts_are_retried_until_success() {
    let mut s = settings(80.0);
    s.retry.max_attempts = 3;
    let h = harness(Arc::new(StaticCompiler::new(90.0)), s).await;
    h.net.set_behavior(
        "r1",
        DeviceBehavior {
            hang_opens: 2,
            ..Default::default()
        },
    );
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;

    h.run().await;

    assert!(matches!(
        h.state(&submission, "r1").await,
        PipelineState::Deployed { .. }
    ));
    let deploys = h.deploy_jobs().await;
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0].state, JobState::Succeeded);
    assert_eq!(deploys[0].attempts, 3);
    assert_eq!(h.net.applies("r1").len(), 1);
    assert_eq!(h.net.opens("r1"), 3);
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_exhausts_attempts() {
    let mut s = settings(80.0);
    s.retry.max_attempts = 2;
    let h = harness(Arc::new(StaticCompiler::new(90.0)), s).await;
    h.net.set_behavior(
        "r1",
        DeviceBehavior {
            unreachable_opens: 10,
            ..Default::default()
        },
    );
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;

    h.run().await;

    match h.state(&submission, "r1").await {
        PipelineState::Failed {
            failure: PipelineFailure::Unreachable { attempts, .. },
        } => assert_eq!(attempts, 2),
        other => panic!("expected unreachable failure, got {other:?}"),
    }
    let deploys = h.deploy_jobs().await;
    assert_eq!(deploys[0].state, JobState::Dead);
    assert_eq!(h.net.running_config("r1"), BASELINE);
    let revision = h
        .coordinator
        .ledger()
        .latest(&DeviceId::from("r1"), &identity())
        .await
        .expect("latest")
        .expect("committed revision");
    assert_eq!(revision.status, RevisionStatus::Approved);
}

#[tokio::test]
async fn devices_in_one_submission_fail_independently() {
    let compiler = Arc::new(StaticCompiler::new(100.0));
    let h = harness(compiler.clone(), settings(50.0)).await;
    h.net.set_behavior(
        "r2",
        DeviceBehavior {
            apply_fails: true,
            ..Default::default()
        },
    );
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1", "r2"]).await;

    h.run().await;

    assert!(matches!(h.state(&submission, "r1").await, PipelineState::Deployed { .. }));
    assert!(matches!(
        h.state(&submission, "r2").await,
        PipelineState::Failed {
            failure: PipelineFailure::Verification { .. }
        }
    ));
    assert_eq!(compiler.calls(), 1);
    assert_eq!(h.deploy_jobs().await.len(), 2);
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_build_never_compiles() {
    let compiler = Arc::new(StaticCompiler::new(100.0));
    let h = harness(compiler.clone(), settings(50.0)).await;
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;

    let job = h.coordinator.cancel(&submission.job_id).await.expect("cancel");
    h.run().await;

    assert_eq!(job.state, JobState::Cancelled);
    assert!(matches!(
        h.state(&submission, "r1").await,
        PipelineState::Failed {
            failure: PipelineFailure::Cancelled { .. }
        }
    ));
    assert_eq!(compiler.calls(), 0);
}

#[tokio::test]
async fn cancelled_deploy_leaves_device_untouched() {
    let h = harness(Arc::new(StaticCompiler::new(100.0)), settings(50.0)).await;
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;
    let jobs = &h.coordinator.stores().jobs;

    let build = jobs
        .claim("manual", Utc::now(), chrono::Duration::seconds(60))
        .await
        .expect("claim")
        .expect("build job");
    h.coordinator.process_job(&build, "manual").await.expect("build");
    let PipelineState::Deploying { job_id, .. } = h.state(&submission, "r1").await else {
        panic!("pipeline should be deploying");
    };

    h.coordinator.cancel(&job_id).await.expect("cancel deploy");
    h.run().await;

    assert!(matches!(
        h.state(&submission, "r1").await,
        PipelineState::Failed {
            failure: PipelineFailure::Cancelled { .. }
        }
    ));
    assert!(h.net.applies("r1").is_empty());
    assert_eq!(h.current_revision("r1").await, None);
}

#[tokio::test]
async fn cancel_during_gating_aborts_the_pipeline() {
    let mut stores = Stores::in_memory();
    stores.revisions = Arc::new(FlakyRevisions {
        inner: stores.revisions.clone(),
        failures: AtomicUsize::new(1),
    });
    let h = harness_with(stores, Arc::new(StaticCompiler::new(100.0)), settings(50.0)).await;
    let submission = h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;
    let jobs = &h.coordinator.stores().jobs;

    let build = jobs
        .claim("manual", Utc::now(), chrono::Duration::seconds(60))
        .await
        .expect("claim")
        .expect("build job");
    let requeued = h.coordinator.process_job(&build, "manual").await.expect("build");
    assert_eq!(requeued.state, JobState::Queued);
    assert!(matches!(
        h.state(&submission, "r1").await,
        PipelineState::Gating { .. }
    ));

    let job = h.coordinator.cancel(&submission.job_id).await.expect("cancel");
    h.run().await;

    assert_eq!(job.state, JobState::Cancelled);
    match h.state(&submission, "r1").await {
        PipelineState::Failed {
            failure: PipelineFailure::Invalid { reason },
        } => assert!(reason.contains("gating"), "reason: {reason}"),
        other => panic!("pipeline left in {}", other.name()),
    }
    assert!(h.deploy_jobs().await.is_empty());
}

#[tokio::test]
async fn abandoned_build_leaves_handed_off_deploys_running() {
    let mut stores = Stores::in_memory();
    stores.jobs = Arc::new(RefusingDeployQueue {
        inner: stores.jobs.clone(),
        allowed: AtomicUsize::new(1),
    });
    let mut s = settings(50.0);
    s.retry.max_attempts = 1;
    let h = harness_with(stores, Arc::new(StaticCompiler::new(100.0)), s).await;
    let submission = h
        .submit(&sample_policy("edge-in", "juniper"), &["r1", "r2"])
        .await;

    h.run().await;

    assert_eq!(h.job(&submission).await.state, JobState::Dead);
    let mut deployed = 0;
    let mut aborted = 0;
    for device in ["r1", "r2"] {
        match h.state(&submission, device).await {
            PipelineState::Deployed { .. } => deployed += 1,
            PipelineState::Failed {
                failure: PipelineFailure::Invalid { reason },
            } => {
                assert!(reason.contains("gave up"), "reason: {reason}");
                aborted += 1;
            }
            other => panic!("{device} left in {}", other.name()),
        }
    }
    assert_eq!((deployed, aborted), (1, 1));
    assert_eq!(h.deploy_jobs().await.len(), 1);
}

#[tokio::test]
async fn platform_mismatch_is_refused_at_submission() {
    let h = harness(Arc::new(StaticCompiler::new(100.0)), settings(0.0)).await;
    h.coordinator
        .register_device(device("fw1", "cisco"))
        .await
        .expect("register");
    let policy = sample_policy("edge-in", "juniper");
    h.coordinator.put_policy(&policy).await.expect("put");

    let err = h
        .coordinator
        .submit(&policy.identity(), &[DeviceId::from("fw1")])
        .await
        .expect_err("platform mismatch");

    assert!(matches!(err, AclError::InvalidPolicy(_)));
    let jobs = h.coordinator.stores().jobs.list(None).await.expect("jobs");
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn resubmitting_unchanged_policy_hits_the_cache() {
    let compiler = Arc::new(StaticCompiler::new(100.0));
    let h = harness(compiler.clone(), settings(50.0)).await;
    let policy = sample_policy("edge-in", "juniper");

    let first = h.submit(&policy, &["r1"]).await;
    h.run().await;
    let second = h.submit(&policy, &["r1"]).await;
    h.run().await;

    assert_eq!(compiler.calls(), 1);
    assert_eq!(h.job(&first).await.output["cached"], false);
    assert_eq!(h.job(&second).await.output["cached"], true);
    let history = h
        .coordinator
        .ledger()
        .history(&DeviceId::from("r1"), &identity())
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].fingerprint, history[1].fingerprint);
}

#[tokio::test]
async fn rollback_redeploys_previous_artifact_as_new_revision() {
    let h = harness(Arc::new(StaticCompiler::new(100.0)), settings(50.0)).await;
    h.submit(&sample_policy("edge-in", "juniper"), &["r1"]).await;
    h.run().await;
    let v1_config = h.net.running_config("r1");
    h.submit(&widened(), &["r1"]).await;
    h.run().await;
    assert_ne!(h.net.running_config("r1"), v1_config);

    let submission = h
        .coordinator
        .rollback(&DeviceId::from("r1"), &identity())
        .await
        .expect("rollback");
    h.run().await;

    assert!(matches!(h.state(&submission, "r1").await, PipelineState::Deployed { .. }));
    assert_eq!(h.net.running_config("r1"), v1_config);
    let history = h
        .coordinator
        .ledger()
        .history(&DeviceId::from("r1"), &identity())
        .await
        .expect("history");
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].seq, 3);
    assert_eq!(history[0].status, RevisionStatus::Deployed);
    assert_eq!(history[0].fingerprint, history[2].fingerprint);
    assert_eq!(h.current_revision("r1").await, Some(history[0].revision_id.clone()));
}

#[tokio::test]
async fn rollback_without_history_is_refused() {
    let h = harness(Arc::new(StaticCompiler::new(100.0)), settings(50.0)).await;

    let err = h
        .coordinator
        .rollback(&DeviceId::from("r1"), &identity())
        .await
        .expect_err("nothing to roll back to");
    assert!(matches!(err, AclError::InvalidPolicy(_)));
}
