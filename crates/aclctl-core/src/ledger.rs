//! Revision ledger: append-only history per (device, policy).
//!
//! Sequence assignment is delegated to the [`RevisionStore`], which applies
//! an optimistic expected-previous-seq check atomically. [`RevisionLedger::commit`]
//! re-reads and retries on conflict; [`RevisionLedger::commit_expecting`]
//! surfaces the conflict to the caller.

use std::sync::Arc;

use aclctl_state::{
    ArtifactCache, ArtifactRecord, DeviceId, NewRevision, PolicyIdentity, RevisionId,
    RevisionRecord, RevisionStatus, RevisionStore, StorageError,
};
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::diff::{diff_lines, ConfigDiff};
use crate::domain::error::{AclError, Result};
use crate::gate::ApprovedArtifact;

/// Conflict retries before `commit` gives up.
pub const DEFAULT_COMMIT_RETRIES: u32 = 16;

#[derive(Clone)]
pub struct RevisionLedger {
    revisions: Arc<dyn RevisionStore>,
    artifacts: Arc<dyn ArtifactCache>,
    max_retries: u32,
}

impl RevisionLedger {
    pub fn new(revisions: Arc<dyn RevisionStore>, artifacts: Arc<dyn ArtifactCache>) -> Self {
        Self {
            revisions,
            artifacts,
            max_retries: DEFAULT_COMMIT_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Append `approved` as the next revision of (device, policy).
    #[instrument(skip_all, fields(device_id = %device_id, policy = %policy))]
    pub async fn commit(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
        approved: &ApprovedArtifact,
    ) -> Result<RevisionRecord> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let expected = self
                .revisions
                .latest(device_id, policy)
                .await?
                .map(|r| r.seq)
                .unwrap_or(0);
            match self
                .commit_expecting(device_id, policy, approved, expected)
                .await
            {
                Err(e) if e.is_conflict() && attempt < self.max_retries => {
                    debug!(attempt, expected, "ledger conflict, re-reading");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    /// Append with an explicit expected previous seq (0 for the first
    /// revision). Fails with [`AclError::Conflict`] when it is stale.
    pub async fn commit_expecting(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
        approved: &ApprovedArtifact,
        expected_prev_seq: u64,
    ) -> Result<RevisionRecord> {
        let artifact = approved.artifact();
        if &artifact.policy != policy {
            return Err(AclError::InvalidPolicy(format!(
                "artifact {} was compiled for {}, not {}",
                artifact.fingerprint.short(),
                artifact.policy,
                policy
            )));
        }
        let new = NewRevision {
            device_id: device_id.clone(),
            policy: policy.clone(),
            fingerprint: artifact.fingerprint.clone(),
            status: RevisionStatus::Approved,
        };
        match self
            .revisions
            .append(new, expected_prev_seq, Utc::now())
            .await
        {
            Ok(revision) => {
                info!(
                    revision_id = %revision.revision_id,
                    seq = revision.seq,
                    fingerprint = %revision.fingerprint.short(),
                    "revision committed"
                );
                Ok(revision)
            }
            Err(StorageError::Conflict { key, reason }) => {
                Err(AclError::Conflict(format!("{key}: {reason}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent.
    pub async fn mark_deployed(&self, revision_id: &RevisionId) -> Result<RevisionRecord> {
        Ok(self
            .revisions
            .transition(revision_id, RevisionStatus::Deployed, Utc::now())
            .await?)
    }

    /// Idempotent.
    pub async fn mark_rolled_back(&self, revision_id: &RevisionId) -> Result<RevisionRecord> {
        Ok(self
            .revisions
            .transition(revision_id, RevisionStatus::RolledBack, Utc::now())
            .await?)
    }

    pub async fn get(&self, revision_id: &RevisionId) -> Result<RevisionRecord> {
        Ok(self.revisions.get(revision_id).await?)
    }

    pub async fn latest(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> Result<Option<RevisionRecord>> {
        Ok(self.revisions.latest(device_id, policy).await?)
    }

    /// Newest first.
    pub async fn history(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> Result<Vec<RevisionRecord>> {
        Ok(self.revisions.history(device_id, policy).await?)
    }

    /// The artifact a revision references.
    pub async fn artifact_for(&self, revision: &RevisionRecord) -> Result<ArtifactRecord> {
        self.artifacts
            .get(&revision.fingerprint)
            .await?
            .ok_or_else(|| {
                StorageError::not_found("artifact", revision.fingerprint.as_str()).into()
            })
    }

    /// Line diff of the configurations of two revisions.
    pub async fn diff(&self, from: &RevisionId, to: &RevisionId) -> Result<ConfigDiff> {
        let a = self.get(from).await?;
        let b = self.get(to).await?;
        let old = self.artifact_for(&a).await?;
        let new = self.artifact_for(&b).await?;
        Ok(ConfigDiff {
            from: format!("{} (seq {})", a.revision_id, a.seq),
            to: format!("{} (seq {})", b.revision_id, b.seq),
            changes: diff_lines(&old.config_text, &new.config_text),
        })
    }

    /// The most recent deployed revision whose artifact differs from the
    /// currently deployed one.
    pub async fn rollback_target(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> Result<Option<RevisionRecord>> {
        let history = self.history(device_id, policy).await?;
        let mut deployed = history
            .into_iter()
            .filter(|r| r.status == RevisionStatus::Deployed);
        let Some(current) = deployed.next() else {
            return Ok(None);
        };
        Ok(deployed.find(|r| r.fingerprint != current.fingerprint))
    }

    /// Re-admit the artifact of a previously deployed revision.
    pub async fn reapprove(&self, revision: &RevisionRecord) -> Result<ApprovedArtifact> {
        if revision.status != RevisionStatus::Deployed {
            return Err(AclError::InvalidPolicy(format!(
                "revision {} was never deployed ({})",
                revision.revision_id, revision.status
            )));
        }
        let artifact = self.artifact_for(revision).await?;
        Ok(ApprovedArtifact::reapproved(artifact))
    }
}

impl std::fmt::Debug for RevisionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionLedger")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
