//! Trait contract tests for every storage seam.
//!
//! Each contract is written once against `Stores` and run against both the
//! in-memory fakes and the SurrealDB backend (`mem://`). Any conforming
//! implementation must pass these.

use std::sync::Arc;

use aclctl_state::storage_traits::*;
use aclctl_state::{StorageError, Stores, SurrealStore};
use chrono::{Duration, Utc};
use serde_json::json;

async fn memory() -> Stores {
    Stores::in_memory()
}

async fn surreal() -> Stores {
    Stores::from_backend(Arc::new(SurrealStore::in_memory().await.unwrap()))
}

macro_rules! contract {
    ($name:ident) => {
        mod $name {
            #[tokio::test]
            async fn memory() {
                super::$name(super::memory().await).await;
            }

            #[tokio::test]
            async fn surreal() {
                super::$name(super::surreal().await).await;
            }
        }
    };
}

fn web() -> PolicyIdentity {
    PolicyIdentity::new("web-edge", "juniper")
}

fn artifact(seed: &str) -> ArtifactRecord {
    ArtifactRecord {
        fingerprint: ContentDigest::from_bytes(seed.as_bytes()),
        policy: web(),
        filter_name: "web-edge".into(),
        config_text: format!("firewall filter web-edge {{ /* {seed} */ }}"),
        diagnostics: vec![],
        coverage_score: 90.0,
        uncovered_terms: vec!["deny-all".into()],
        compiled_at: Utc::now(),
    }
}

fn device(id: &str) -> DeviceRecord {
    DeviceRecord {
        device_id: DeviceId::from(id),
        address: "192.0.2.10".into(),
        port: Some(22),
        credential_ref: "lab".into(),
        platform: "juniper".into(),
        current_revision: None,
    }
}

fn new_revision(device: &str, seed: &str) -> NewRevision {
    NewRevision {
        device_id: DeviceId::from(device),
        policy: web(),
        fingerprint: ContentDigest::from_bytes(seed.as_bytes()),
        status: RevisionStatus::Approved,
    }
}

fn new_job(kind: JobKind, max_attempts: u32) -> NewJob {
    NewJob {
        kind,
        payload: json!({"policy": {"name": "web-edge", "platform": "juniper"}}),
        pipeline_ids: vec![PipelineId::from("p-1")],
        max_attempts,
        ready_at: Utc::now() - Duration::seconds(1),
    }
}

// ===========================================================================
// ArtifactCache
// ===========================================================================

async fn artifact_upsert_then_get(stores: Stores) {
    let a = artifact("v1");
    assert!(stores.artifacts.get(&a.fingerprint).await.unwrap().is_none());

    let stored = stores.artifacts.upsert(a.clone()).await.unwrap();
    assert_eq!(stored.fingerprint, a.fingerprint);
    assert_eq!(stored.config_text, a.config_text);

    let fetched = stores.artifacts.get(&a.fingerprint).await.unwrap().unwrap();
    assert_eq!(fetched.config_text, a.config_text);
    assert_eq!(fetched.uncovered_terms, vec!["deny-all".to_string()]);
}
contract!(artifact_upsert_then_get);

async fn artifact_upsert_is_idempotent(stores: Stores) {
    let a = artifact("v1");
    stores.artifacts.upsert(a.clone()).await.unwrap();
    let again = stores.artifacts.upsert(a.clone()).await.unwrap();
    assert_eq!(again.fingerprint, a.fingerprint);
    let fetched = stores.artifacts.get(&a.fingerprint).await.unwrap().unwrap();
    assert_eq!(fetched.coverage_score, 90.0);
}
contract!(artifact_upsert_is_idempotent);

// ===========================================================================
// PolicyStore
// ===========================================================================

async fn policy_versions_bump_on_change_only(stores: Stores) {
    let id = web();
    let fp1 = ContentDigest::from_bytes(b"doc-1");
    let fp2 = ContentDigest::from_bytes(b"doc-2");

    let v1 = stores
        .policies
        .put(&id, json!({"terms": []}), fp1.clone())
        .await
        .unwrap();
    assert_eq!(v1.version, 1);

    let same = stores
        .policies
        .put(&id, json!({"terms": []}), fp1)
        .await
        .unwrap();
    assert_eq!(same.version, 1);

    let v2 = stores
        .policies
        .put(&id, json!({"terms": ["a"]}), fp2.clone())
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let latest = stores.policies.get(&id).await.unwrap();
    assert_eq!(latest.fingerprint, fp2);
    assert_eq!(latest.document, json!({"terms": ["a"]}));

    let first = stores.policies.get_version(&id, 1).await.unwrap();
    assert_eq!(first.document, json!({"terms": []}));

    let all = stores.policies.list().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].version, 2);
}
contract!(policy_versions_bump_on_change_only);

async fn policy_get_missing(stores: Stores) {
    let err = stores
        .policies
        .get(&PolicyIdentity::new("nope", "juniper"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}
contract!(policy_get_missing);

// ===========================================================================
// DeviceRegistry
// ===========================================================================

async fn device_upsert_preserves_pointer(stores: Stores) {
    let now = Utc::now();
    stores.devices.upsert(device("edge-1")).await.unwrap();

    let rev = stores
        .revisions
        .append(new_revision("edge-1", "a"), 0, now)
        .await
        .unwrap();
    let deployed = stores
        .revisions
        .transition(&rev.revision_id, RevisionStatus::Deployed, now)
        .await
        .unwrap();
    stores
        .devices
        .set_current_revision(&DeviceId::from("edge-1"), &deployed)
        .await
        .unwrap();

    let mut changed = device("edge-1");
    changed.address = "192.0.2.99".into();
    stores.devices.upsert(changed).await.unwrap();

    let fetched = stores.devices.get(&DeviceId::from("edge-1")).await.unwrap();
    assert_eq!(fetched.address, "192.0.2.99");
    assert_eq!(fetched.current_revision, Some(rev.revision_id));
}
contract!(device_upsert_preserves_pointer);

async fn device_pointer_rejects_undeployed_revision(stores: Stores) {
    stores.devices.upsert(device("edge-1")).await.unwrap();
    let rev = stores
        .revisions
        .append(new_revision("edge-1", "a"), 0, Utc::now())
        .await
        .unwrap();
    let err = stores
        .devices
        .set_current_revision(&DeviceId::from("edge-1"), &rev)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));

    let fetched = stores.devices.get(&DeviceId::from("edge-1")).await.unwrap();
    assert!(fetched.current_revision.is_none());
}
contract!(device_pointer_rejects_undeployed_revision);

async fn device_list_sorted(stores: Stores) {
    stores.devices.upsert(device("edge-2")).await.unwrap();
    stores.devices.upsert(device("edge-1")).await.unwrap();
    let ids: Vec<String> = stores
        .devices
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.device_id.0)
        .collect();
    assert_eq!(ids, vec!["edge-1", "edge-2"]);
}
contract!(device_list_sorted);

// ===========================================================================
// RevisionStore
// ===========================================================================

async fn revision_seq_starts_at_one_and_increments(stores: Stores) {
    let now = Utc::now();
    let r1 = stores
        .revisions
        .append(new_revision("edge-1", "a"), 0, now)
        .await
        .unwrap();
    let r2 = stores
        .revisions
        .append(new_revision("edge-1", "b"), 1, now)
        .await
        .unwrap();
    assert_eq!((r1.seq, r2.seq), (1, 2));

    // Independent chain for another device.
    let other = stores
        .revisions
        .append(new_revision("edge-2", "a"), 0, now)
        .await
        .unwrap();
    assert_eq!(other.seq, 1);

    let history = stores
        .revisions
        .history(&DeviceId::from("edge-1"), &web())
        .await
        .unwrap();
    let seqs: Vec<u64> = history.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![2, 1]);

    let latest = stores
        .revisions
        .latest(&DeviceId::from("edge-1"), &web())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.revision_id, r2.revision_id);
}
contract!(revision_seq_starts_at_one_and_increments);

async fn revision_stale_expected_seq_conflicts(stores: Stores) {
    let now = Utc::now();
    stores
        .revisions
        .append(new_revision("edge-1", "a"), 0, now)
        .await
        .unwrap();
    let err = stores
        .revisions
        .append(new_revision("edge-1", "b"), 0, now)
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err:?}");

    let history = stores
        .revisions
        .history(&DeviceId::from("edge-1"), &web())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}
contract!(revision_stale_expected_seq_conflicts);

async fn revision_transitions_are_idempotent_and_final(stores: Stores) {
    let now = Utc::now();
    let rev = stores
        .revisions
        .append(new_revision("edge-1", "a"), 0, now)
        .await
        .unwrap();

    let rolled = stores
        .revisions
        .transition(&rev.revision_id, RevisionStatus::RolledBack, now)
        .await
        .unwrap();
    assert_eq!(rolled.status, RevisionStatus::RolledBack);

    let again = stores
        .revisions
        .transition(&rev.revision_id, RevisionStatus::RolledBack, now)
        .await
        .unwrap();
    assert_eq!(again.status, RevisionStatus::RolledBack);

    let err = stores
        .revisions
        .transition(&rev.revision_id, RevisionStatus::Deployed, now)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));
}
contract!(revision_transitions_are_idempotent_and_final);

async fn revision_concurrent_appends_are_gapless(stores: Stores) {
    let mut handles = Vec::new();
    for worker in 0..4 {
        let revisions = stores.revisions.clone();
        handles.push(tokio::spawn(async move {
            let mut written = 0;
            while written < 3 {
                let latest = revisions
                    .latest(&DeviceId::from("edge-1"), &web())
                    .await
                    .unwrap()
                    .map(|r| r.seq)
                    .unwrap_or(0);
                match revisions
                    .append(
                        new_revision("edge-1", &format!("w{worker}-{written}")),
                        latest,
                        Utc::now(),
                    )
                    .await
                {
                    Ok(_) => written += 1,
                    Err(e) if e.is_conflict() => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }
    for joined in futures::future::join_all(handles).await {
        joined.unwrap();
    }

    let mut seqs: Vec<u64> = stores
        .revisions
        .history(&DeviceId::from("edge-1"), &web())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.seq)
        .collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=12).collect::<Vec<u64>>());
}
contract!(revision_concurrent_appends_are_gapless);

// ===========================================================================
// JobQueue
// ===========================================================================

async fn job_claim_finish_lifecycle(stores: Stores) {
    let now = Utc::now();
    let job = stores
        .jobs
        .enqueue(new_job(JobKind::Build, 3), now)
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(stores.jobs.outstanding().await.unwrap(), 1);

    let claimed = stores
        .jobs
        .claim("w1", now, Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.job_id, job.job_id);
    assert_eq!(claimed.state, JobState::Running);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.payload, job.payload);

    // Nothing else is claimable while the lease is live.
    assert!(stores
        .jobs
        .claim("w2", now, Duration::seconds(30))
        .await
        .unwrap()
        .is_none());

    let done = stores
        .jobs
        .finish(
            &claimed,
            JobOutcome::Succeeded {
                output: json!({"ok": true}),
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.output, json!({"ok": true}));
    assert_eq!(stores.jobs.outstanding().await.unwrap(), 0);
    assert_eq!(
        stores
            .jobs
            .list(Some(JobState::Succeeded))
            .await
            .unwrap()
            .len(),
        1
    );
}
contract!(job_claim_finish_lifecycle);

async fn job_expired_claim_is_redelivered(stores: Stores) {
    let now = Utc::now();
    stores
        .jobs
        .enqueue(new_job(JobKind::Deploy, 3), now)
        .await
        .unwrap();
    let first = stores
        .jobs
        .claim("w1", now, Duration::seconds(5))
        .await
        .unwrap()
        .unwrap();

    let later = now + Duration::seconds(6);
    let second = stores
        .jobs
        .claim("w2", later, Duration::seconds(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.job_id, first.job_id);
    assert_eq!(second.worker.as_deref(), Some("w2"));

    // The superseded claimant can no longer finish the job.
    let err = stores
        .jobs
        .finish(&first, JobOutcome::Succeeded { output: json!(null) }, later)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}
contract!(job_expired_claim_is_redelivered);

async fn job_retry_until_dead(stores: Stores) {
    let now = Utc::now();
    stores
        .jobs
        .enqueue(new_job(JobKind::Deploy, 2), now)
        .await
        .unwrap();

    let claimed = stores
        .jobs
        .claim("w1", now, Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    let retried = stores
        .jobs
        .finish(
            &claimed,
            JobOutcome::Retry {
                error: "unreachable".into(),
                ready_at: now + Duration::seconds(10),
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(retried.state, JobState::Queued);

    // Backoff: not claimable until ready_at.
    assert!(stores
        .jobs
        .claim("w1", now, Duration::seconds(30))
        .await
        .unwrap()
        .is_none());

    let later = now + Duration::seconds(11);
    let claimed = stores
        .jobs
        .claim("w1", later, Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    let dead = stores
        .jobs
        .finish(
            &claimed,
            JobOutcome::Retry {
                error: "unreachable".into(),
                ready_at: later,
            },
            later,
        )
        .await
        .unwrap();
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 2);
}
contract!(job_retry_until_dead);

async fn job_cancel_queued_and_running(stores: Stores) {
    let now = Utc::now();
    let queued = stores
        .jobs
        .enqueue(new_job(JobKind::Build, 1), now)
        .await
        .unwrap();
    let cancelled = stores.jobs.cancel(&queued.job_id, now).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(stores
        .jobs
        .claim("w1", now, Duration::seconds(30))
        .await
        .unwrap()
        .is_none());

    stores
        .jobs
        .enqueue(new_job(JobKind::Deploy, 1), now)
        .await
        .unwrap();
    let running = stores
        .jobs
        .claim("w1", now, Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    let flagged = stores.jobs.cancel(&running.job_id, now).await.unwrap();
    assert_eq!(flagged.state, JobState::Running);
    assert!(flagged.cancel_requested);

    // Cancelling bumps the version, so the worker must re-read before finishing.
    let current = stores.jobs.get(&running.job_id).await.unwrap();
    let done = stores
        .jobs
        .finish(&current, JobOutcome::Cancelled, now)
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Cancelled);

    let err = stores.jobs.cancel(&running.job_id, now).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));
}
contract!(job_cancel_queued_and_running);

// ===========================================================================
// DeviceLeases
// ===========================================================================

async fn lease_is_exclusive_until_released(stores: Stores) {
    let now = Utc::now();
    let id = DeviceId::from("edge-1");
    let ttl = Duration::seconds(60);

    let lease = stores
        .leases
        .try_acquire(&id, "w1", now, ttl)
        .await
        .unwrap()
        .unwrap();
    assert!(stores
        .leases
        .try_acquire(&id, "w2", now, ttl)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        stores.leases.holder(&id, now).await.unwrap().unwrap().holder,
        "w1"
    );

    stores.leases.release(&lease).await.unwrap();
    assert!(stores.leases.holder(&id, now).await.unwrap().is_none());
    // Releasing twice is a no-op.
    stores.leases.release(&lease).await.unwrap();

    assert!(stores
        .leases
        .try_acquire(&id, "w2", now, ttl)
        .await
        .unwrap()
        .is_some());
}
contract!(lease_is_exclusive_until_released);

async fn lease_expired_can_be_taken_over(stores: Stores) {
    let now = Utc::now();
    let id = DeviceId::from("edge-1");
    let stale = stores
        .leases
        .try_acquire(&id, "crashed", now, Duration::seconds(10))
        .await
        .unwrap()
        .unwrap();

    let later = now + Duration::seconds(11);
    let fresh = stores
        .leases
        .try_acquire(&id, "w2", later, Duration::seconds(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.holder, "w2");

    let err = stores.leases.release(&stale).await.unwrap_err();
    assert!(matches!(err, StorageError::LeaseHeld { .. }));
    assert_eq!(
        stores.leases.holder(&id, later).await.unwrap().unwrap().token,
        fresh.token
    );
}
contract!(lease_expired_can_be_taken_over);

async fn lease_renewal_extends_only_a_live_hold(stores: Stores) {
    let now = Utc::now();
    let id = DeviceId::from("edge-1");
    let lease = stores
        .leases
        .try_acquire(&id, "w1", now, Duration::seconds(10))
        .await
        .unwrap()
        .unwrap();

    // Renewed at t+8 for 10s: still held at t+15, where the first TTL had run out.
    let renewed = stores
        .leases
        .renew(&lease, now + Duration::seconds(8), Duration::seconds(10))
        .await
        .unwrap();
    assert_eq!(renewed.token, lease.token);
    assert!(stores
        .leases
        .try_acquire(&id, "w2", now + Duration::seconds(15), Duration::seconds(10))
        .await
        .unwrap()
        .is_none());

    // Once expired the hold cannot be revived, and a takeover wins.
    let after_expiry = now + Duration::seconds(19);
    let err = stores
        .leases
        .renew(&lease, after_expiry, Duration::seconds(10))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::LeaseHeld { .. }));

    let other = stores
        .leases
        .try_acquire(&id, "w2", after_expiry, Duration::seconds(10))
        .await
        .unwrap()
        .unwrap();
    let err = stores
        .leases
        .renew(&lease, after_expiry, Duration::seconds(10))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::LeaseHeld { ref holder, .. } if holder == "w2"));

    stores.leases.release(&other).await.unwrap();
    let err = stores
        .leases
        .renew(&other, after_expiry, Duration::seconds(10))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::LeaseHeld { .. }));
}
contract!(lease_renewal_extends_only_a_live_hold);

// ===========================================================================
// PipelineLedger
// ===========================================================================

async fn pipeline_transitions_append_in_order(stores: Stores) {
    let now = Utc::now();
    let created = stores
        .pipelines
        .create(PipelineRecord::new(
            web(),
            DeviceId::from("edge-1"),
            json!({"state": "submitted"}),
            now,
        ))
        .await
        .unwrap();

    let building = stores
        .pipelines
        .record_transition(
            &created.pipeline_id,
            1,
            json!({"state": "building"}),
            Some("claimed by w1".into()),
            now,
        )
        .await
        .unwrap();
    assert_eq!(building.seq(), 2);
    assert_eq!(building.state, json!({"state": "building"}));

    let err = stores
        .pipelines
        .record_transition(
            &created.pipeline_id,
            1,
            json!({"state": "gating"}),
            None,
            now,
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let fetched = stores.pipelines.get(&created.pipeline_id).await.unwrap();
    let states: Vec<_> = fetched
        .transitions
        .iter()
        .map(|t| t.state["state"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(states, vec!["submitted", "building"]);
    assert_eq!(fetched.transitions[1].note.as_deref(), Some("claimed by w1"));

    let for_device = stores
        .pipelines
        .list(Some(&DeviceId::from("edge-1")))
        .await
        .unwrap();
    assert_eq!(for_device.len(), 1);
    assert!(stores
        .pipelines
        .list(Some(&DeviceId::from("edge-9")))
        .await
        .unwrap()
        .is_empty());
}
contract!(pipeline_transitions_append_in_order);
