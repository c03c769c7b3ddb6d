//! SurrealDB-backed implementation of every storage trait
//!
//! Uses the row types in `schema` for persistence, converting to/from
//! `storage_traits` types at the boundary. Concurrency control:
//! - revisions: transaction with an expected-seq guard plus a unique index
//! - jobs and pipelines: compare-and-set on a version column
//! - leases: record-id uniqueness, takeover only when expired

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle::SurrealHandle;
use crate::schema::{
    millis, DbArtifact, DbDevice, DbJob, DbLease, DbPipeline, DbPolicy, DbRevision,
};
use crate::storage_traits::*;

/// Default on-disk location when no connection is configured
pub const DEFAULT_URL: &str = "surrealkv://.aclctl/db";

/// How many claim candidates to try before reporting an empty queue
const CLAIM_CANDIDATES: usize = 8;

/// SurrealDB-backed store.
#[derive(Clone)]
pub struct SurrealStore {
    db: Surreal<Any>,
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn is_conflict_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("sequence conflict")
        || msg.contains("already contains")
        || msg.contains("already exists")
        || msg.contains("conflict")
}

/// Classify a write failure as `Conflict` or `Backend`.
fn write_err(key: &str, e: surrealdb::Error) -> StorageError {
    let msg = e.to_string();
    if is_conflict_message(&msg) {
        StorageError::conflict(key, msg)
    } else {
        StorageError::Backend(msg)
    }
}

/// Surface per-statement errors of a multi-statement write.
fn check_write(mut response: surrealdb::Response, key: &str) -> StorageResult<surrealdb::Response> {
    let errors = response.take_errors();
    if errors.is_empty() {
        return Ok(response);
    }
    let mut messages: Vec<(usize, String)> =
        errors.into_iter().map(|(i, e)| (i, e.to_string())).collect();
    messages.sort_by_key(|(i, _)| *i);
    let joined = messages
        .into_iter()
        .map(|(_, m)| m)
        .collect::<Vec<_>>()
        .join("; ");
    if is_conflict_message(&joined) {
        Err(StorageError::conflict(key, joined))
    } else {
        Err(StorageError::Backend(joined))
    }
}

/// Rows of the first (or only) statement.
fn take_rows<T>(mut res: surrealdb::Response) -> StorageResult<Vec<T>>
where
    T: serde::de::DeserializeOwned,
{
    res.take(0).map_err(backend)
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

impl SurrealStore {
    pub fn new(handle: SurrealHandle) -> Self {
        Self {
            db: handle.db().clone(),
        }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let handle = SurrealHandle::setup_db().await?;
        info!("SurrealStore connected (in-memory)");
        Ok(Self::new(handle))
    }

    /// Create from environment variables, falling back to [`DEFAULT_URL`].
    ///
    /// Uses the env-var chain of [`SurrealHandle::setup_from_env`].
    pub async fn from_env() -> crate::Result<Self> {
        let handle = SurrealHandle::setup_from_env(DEFAULT_URL).await?;
        Ok(Self::new(handle))
    }

    async fn fetch_revision(&self, revision_id: &RevisionId) -> StorageResult<RevisionRecord> {
        let res = self
            .db
            .query("SELECT * FROM revisions WHERE revision_id = $rid LIMIT 1")
            .bind(("rid", revision_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbRevision> = take_rows(res)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("revision", revision_id.as_str()))?
            .try_into()
    }

    async fn fetch_job(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        let res = self
            .db
            .query("SELECT * FROM type::thing('jobs', $id)")
            .bind(("id", job_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbJob> = take_rows(res)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("job", job_id.as_str()))?
            .try_into()
    }

    /// Replace a job row only if its version is still `expected`.
    async fn cas_job(&self, next: &JobRecord, expected: u64) -> StorageResult<Option<JobRecord>> {
        let row = DbJob::from_record(next)?;
        let res = self
            .db
            .query("UPDATE type::thing('jobs', $id) CONTENT $row WHERE version = $expected RETURN AFTER")
            .bind(("id", next.job_id.to_string()))
            .bind(("row", row))
            .bind(("expected", expected as i64))
            .await
            .map_err(|e| write_err(next.job_id.as_str(), e))?;
        let rows: Vec<DbJob> = take_rows(res)?;
        rows.into_iter().next().map(JobRecord::try_from).transpose()
    }

    async fn fetch_lease(&self, device_id: &DeviceId) -> StorageResult<Option<DeviceLease>> {
        let res = self
            .db
            .query("SELECT * FROM type::thing('leases', $id)")
            .bind(("id", device_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbLease> = take_rows(res)?;
        Ok(rows.into_iter().next().map(DeviceLease::from))
    }

    async fn latest_policy(&self, identity: &PolicyIdentity) -> StorageResult<Option<PolicyRecord>> {
        let res = self
            .db
            .query("SELECT * FROM policies WHERE policy_key = $key ORDER BY version DESC LIMIT 1")
            .bind(("key", identity.key()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbPolicy> = take_rows(res)?;
        rows.into_iter().next().map(PolicyRecord::try_from).transpose()
    }
}

// ---------------------------------------------------------------------------
// ArtifactCache
// ---------------------------------------------------------------------------

#[async_trait]
impl ArtifactCache for SurrealStore {
    async fn get(&self, fingerprint: &PolicyFingerprint) -> StorageResult<Option<ArtifactRecord>> {
        let res = self
            .db
            .query("SELECT * FROM type::thing('artifacts', $fp)")
            .bind(("fp", fingerprint.as_str().to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbArtifact> = take_rows(res)?;
        rows.into_iter().next().map(ArtifactRecord::try_from).transpose()
    }

    async fn upsert(&self, artifact: ArtifactRecord) -> StorageResult<ArtifactRecord> {
        let row = DbArtifact::from(&artifact);
        let fp = artifact.fingerprint.as_str().to_string();
        debug!(fingerprint = %artifact.fingerprint.short(), "upserting artifact");

        let res = self
            .db
            .query("UPSERT type::thing('artifacts', $fp) CONTENT $row RETURN AFTER")
            .bind(("fp", fp.clone()))
            .bind(("row", row))
            .await
            .map_err(|e| write_err(&fp, e))?;
        let res = check_write(res, &fp)?;
        let rows: Vec<DbArtifact> = take_rows(res)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::Backend(format!("upsert of artifact {fp} returned nothing")))?
            .try_into()
    }
}

// ---------------------------------------------------------------------------
// PolicyStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PolicyStore for SurrealStore {
    async fn put(
        &self,
        identity: &PolicyIdentity,
        document: serde_json::Value,
        fingerprint: PolicyFingerprint,
    ) -> StorageResult<PolicyRecord> {
        let latest = self.latest_policy(identity).await?;
        if let Some(latest) = &latest {
            if latest.fingerprint == fingerprint {
                return Ok(latest.clone());
            }
        }
        let record = PolicyRecord {
            identity: identity.clone(),
            version: latest.map(|p| p.version).unwrap_or(0) + 1,
            document,
            fingerprint,
            updated_at: Utc::now(),
        };
        let key = identity.key();
        let row = DbPolicy::from_record(&record)?;
        let res = self
            .db
            .query("CREATE policies CONTENT $row")
            .bind(("row", row.clone()))
            .await
            .map_err(|e| write_err(&key, e))?;
        check_write(res, &key)?;
        row.try_into()
    }

    async fn get(&self, identity: &PolicyIdentity) -> StorageResult<PolicyRecord> {
        self.latest_policy(identity)
            .await?
            .ok_or_else(|| StorageError::not_found("policy", identity.key()))
    }

    async fn get_version(
        &self,
        identity: &PolicyIdentity,
        version: u64,
    ) -> StorageResult<PolicyRecord> {
        let res = self
            .db
            .query("SELECT * FROM policies WHERE policy_key = $key AND version = $version LIMIT 1")
            .bind(("key", identity.key()))
            .bind(("version", version as i64))
            .await
            .map_err(backend)?;
        let rows: Vec<DbPolicy> = take_rows(res)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| {
                StorageError::not_found("policy", format!("{} v{}", identity.key(), version))
            })?
            .try_into()
    }

    async fn list(&self) -> StorageResult<Vec<PolicyRecord>> {
        let res = self
            .db
            .query("SELECT * FROM policies ORDER BY policy_key ASC, version DESC")
            .await
            .map_err(backend)?;
        let rows: Vec<DbPolicy> = take_rows(res)?;
        let mut latest: Vec<PolicyRecord> = Vec::new();
        for row in rows {
            let record = PolicyRecord::try_from(row)?;
            if latest.last().map(|p| p.identity != record.identity).unwrap_or(true) {
                latest.push(record);
            }
        }
        latest.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(latest)
    }
}

// ---------------------------------------------------------------------------
// DeviceRegistry
// ---------------------------------------------------------------------------

#[async_trait]
impl DeviceRegistry for SurrealStore {
    async fn upsert(&self, mut device: DeviceRecord) -> StorageResult<DeviceRecord> {
        match DeviceRegistry::get(self, &device.device_id).await {
            Ok(existing) => device.current_revision = existing.current_revision,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let id = device.device_id.to_string();
        let res = self
            .db
            .query("UPSERT type::thing('devices', $id) CONTENT $row")
            .bind(("id", id.clone()))
            .bind(("row", DbDevice::from(&device)))
            .await
            .map_err(|e| write_err(&id, e))?;
        check_write(res, &id)?;
        Ok(device)
    }

    async fn get(&self, device_id: &DeviceId) -> StorageResult<DeviceRecord> {
        let res = self
            .db
            .query("SELECT * FROM type::thing('devices', $id)")
            .bind(("id", device_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbDevice> = take_rows(res)?;
        rows.into_iter()
            .next()
            .map(DeviceRecord::from)
            .ok_or_else(|| StorageError::not_found("device", device_id.as_str()))
    }

    async fn list(&self) -> StorageResult<Vec<DeviceRecord>> {
        let res = self
            .db
            .query("SELECT * FROM devices ORDER BY device_id ASC")
            .await
            .map_err(backend)?;
        let rows: Vec<DbDevice> = take_rows(res)?;
        Ok(rows.into_iter().map(DeviceRecord::from).collect())
    }

    async fn set_current_revision(
        &self,
        device_id: &DeviceId,
        revision: &RevisionRecord,
    ) -> StorageResult<DeviceRecord> {
        check_pointer_target(device_id, revision)?;
        let res = self
            .db
            .query("UPDATE type::thing('devices', $id) SET current_revision = $rev RETURN AFTER")
            .bind(("id", device_id.to_string()))
            .bind(("rev", revision.revision_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbDevice> = take_rows(res)?;
        rows.into_iter()
            .next()
            .map(DeviceRecord::from)
            .ok_or_else(|| StorageError::not_found("device", device_id.as_str()))
    }
}

// ---------------------------------------------------------------------------
// RevisionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RevisionStore for SurrealStore {
    async fn append(
        &self,
        revision: NewRevision,
        expected_prev_seq: u64,
        now: DateTime<Utc>,
    ) -> StorageResult<RevisionRecord> {
        let key = ledger_key(&revision.device_id, &revision.policy);
        let record = RevisionRecord {
            revision_id: RevisionId::new(),
            device_id: revision.device_id,
            policy: revision.policy,
            fingerprint: revision.fingerprint,
            seq: expected_prev_seq + 1,
            status: revision.status,
            created_at: now,
            updated_at: now,
        };
        let row = DbRevision::from(&record);
        debug!(key = %key, seq = record.seq, "appending revision");

        let sql = r#"
            BEGIN TRANSACTION;
            LET $latest = math::max((SELECT VALUE seq FROM revisions WHERE device_id = $device AND policy_key = $policy)) ?? 0;
            IF $latest != $expected {
                THROW "sequence conflict: expected " + <string> $expected + ", found " + <string> $latest;
            };
            CREATE revisions CONTENT $row;
            COMMIT TRANSACTION;
        "#;
        let res = self
            .db
            .query(sql)
            .bind(("device", row.device_id.clone()))
            .bind(("policy", row.policy_key.clone()))
            .bind(("expected", expected_prev_seq as i64))
            .bind(("row", row.clone()))
            .await
            .map_err(|e| write_err(&key, e))?;
        check_write(res, &key)?;
        row.try_into()
    }

    async fn latest(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> StorageResult<Option<RevisionRecord>> {
        let res = self
            .db
            .query(
                "SELECT * FROM revisions WHERE device_id = $device AND policy_key = $policy ORDER BY seq DESC LIMIT 1",
            )
            .bind(("device", device_id.to_string()))
            .bind(("policy", policy.key()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbRevision> = take_rows(res)?;
        rows.into_iter().next().map(RevisionRecord::try_from).transpose()
    }

    async fn get(&self, revision_id: &RevisionId) -> StorageResult<RevisionRecord> {
        self.fetch_revision(revision_id).await
    }

    async fn history(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> StorageResult<Vec<RevisionRecord>> {
        let res = self
            .db
            .query(
                "SELECT * FROM revisions WHERE device_id = $device AND policy_key = $policy ORDER BY seq DESC",
            )
            .bind(("device", device_id.to_string()))
            .bind(("policy", policy.key()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbRevision> = take_rows(res)?;
        rows.into_iter().map(RevisionRecord::try_from).collect()
    }

    async fn transition(
        &self,
        revision_id: &RevisionId,
        to: RevisionStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<RevisionRecord> {
        let current = self.fetch_revision(revision_id).await?;
        let Some(next) = current.transition(to, now)? else {
            return Ok(current);
        };

        let res = self
            .db
            .query(
                "UPDATE revisions SET status = $to, updated_at = $at WHERE revision_id = $rid AND status = $from RETURN AFTER",
            )
            .bind(("rid", revision_id.to_string()))
            .bind(("to", to.as_str().to_string()))
            .bind(("from", current.status.as_str().to_string()))
            .bind(("at", millis(now)))
            .await
            .map_err(backend)?;
        let rows: Vec<DbRevision> = take_rows(res)?;
        if let Some(row) = rows.into_iter().next() {
            return row.try_into();
        }

        // Lost a race; the record moved on underneath us.
        let reread = self.fetch_revision(revision_id).await?;
        if reread.status == next.status {
            Ok(reread)
        } else {
            Err(StorageError::InvalidTransition {
                id: revision_id.to_string(),
                from: reread.status.to_string(),
                to: to.to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

#[async_trait]
impl JobQueue for SurrealStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StorageResult<JobRecord> {
        let record = JobRecord::new(job, now);
        let row = DbJob::from_record(&record)?;
        let id = record.job_id.to_string();
        let res = self
            .db
            .query("CREATE type::thing('jobs', $id) CONTENT $row")
            .bind(("id", id.clone()))
            .bind(("row", row.clone()))
            .await
            .map_err(|e| write_err(&id, e))?;
        check_write(res, &id)?;
        row.try_into()
    }

    async fn claim(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> StorageResult<Option<JobRecord>> {
        let res = self
            .db
            .query(
                r#"SELECT * FROM jobs
                   WHERE (state = 'queued' AND ready_at <= $now)
                      OR (state = 'running' AND (lease_expires_at = NONE OR lease_expires_at <= $now))
                   ORDER BY ready_at ASC
                   LIMIT $limit"#,
            )
            .bind(("now", millis(now)))
            .bind(("limit", CLAIM_CANDIDATES as i64))
            .await
            .map_err(backend)?;
        let rows: Vec<DbJob> = take_rows(res)?;

        for row in rows {
            let candidate = JobRecord::try_from(row)?;
            let next = candidate.claimed(worker, now, visibility);
            if let Some(claimed) = self.cas_job(&next, candidate.version).await? {
                debug!(job_id = %claimed.job_id, worker, "claimed job");
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    async fn finish(
        &self,
        claimed: &JobRecord,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<JobRecord> {
        let current = self.fetch_job(&claimed.job_id).await?;
        if current.version != claimed.version {
            return Err(StorageError::conflict(
                claimed.job_id.to_string(),
                "claim superseded",
            ));
        }
        let next = current.finished(outcome, now)?;
        self.cas_job(&next, current.version)
            .await?
            .ok_or_else(|| StorageError::conflict(claimed.job_id.to_string(), "claim superseded"))
    }

    async fn cancel(&self, job_id: &JobId, now: DateTime<Utc>) -> StorageResult<JobRecord> {
        for _ in 0..3 {
            let current = self.fetch_job(job_id).await?;
            let next = current.cancel_requested(now)?;
            if let Some(updated) = self.cas_job(&next, current.version).await? {
                return Ok(updated);
            }
        }
        Err(StorageError::conflict(
            job_id.to_string(),
            "job kept changing during cancel",
        ))
    }

    async fn get(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        self.fetch_job(job_id).await
    }

    async fn list(&self, state: Option<JobState>) -> StorageResult<Vec<JobRecord>> {
        let res = match state {
            Some(state) => self
                .db
                .query("SELECT * FROM jobs WHERE state = $state ORDER BY created_at ASC")
                .bind(("state", state.as_str().to_string()))
                .await
                .map_err(backend)?,
            None => self
                .db
                .query("SELECT * FROM jobs ORDER BY created_at ASC")
                .await
                .map_err(backend)?,
        };
        let rows: Vec<DbJob> = take_rows(res)?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn outstanding(&self) -> StorageResult<usize> {
        let res = self
            .db
            .query("SELECT count() FROM jobs WHERE state = 'queued' OR state = 'running' GROUP ALL")
            .await
            .map_err(backend)?;
        let rows: Vec<CountRow> = take_rows(res)?;
        Ok(rows.first().map(|r| r.count.max(0) as usize).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// DeviceLeases
// ---------------------------------------------------------------------------

#[async_trait]
impl DeviceLeases for SurrealStore {
    async fn try_acquire(
        &self,
        device_id: &DeviceId,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<Option<DeviceLease>> {
        let lease = DeviceLease::new(device_id, holder, now, ttl);
        let row = DbLease::from(&lease);
        let id = device_id.to_string();

        let res = self
            .db
            .query("CREATE type::thing('leases', $id) CONTENT $row")
            .bind(("id", id.clone()))
            .bind(("row", row.clone()))
            .await
            .map_err(|e| write_err(&id, e))?;
        match check_write(res, &id) {
            Ok(_) => return Ok(Some(DeviceLease::from(row))),
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }

        // Held: take over only if the current lease has expired.
        let res = self
            .db
            .query("UPDATE type::thing('leases', $id) CONTENT $row WHERE expires_at <= $now RETURN AFTER")
            .bind(("id", id.clone()))
            .bind(("row", row))
            .bind(("now", millis(now)))
            .await
            .map_err(|e| write_err(&id, e))?;
        let rows: Vec<DbLease> = take_rows(res)?;
        Ok(rows.into_iter().next().map(DeviceLease::from))
    }

    async fn release(&self, lease: &DeviceLease) -> StorageResult<()> {
        let res = self
            .db
            .query("DELETE type::thing('leases', $id) WHERE token = $token RETURN BEFORE")
            .bind(("id", lease.device_id.to_string()))
            .bind(("token", lease.token.clone()))
            .await
            .map_err(backend)?;
        let deleted: Vec<DbLease> = take_rows(res)?;
        if !deleted.is_empty() {
            return Ok(());
        }
        match self.fetch_lease(&lease.device_id).await? {
            Some(current) if current.token != lease.token => Err(StorageError::LeaseHeld {
                device_id: lease.device_id.to_string(),
                holder: current.holder,
            }),
            _ => Ok(()),
        }
    }

    async fn renew(
        &self,
        lease: &DeviceLease,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<DeviceLease> {
        let res = self
            .db
            .query(
                "UPDATE type::thing('leases', $id) SET expires_at = $expires \
                 WHERE token = $token AND expires_at > $now RETURN AFTER",
            )
            .bind(("id", lease.device_id.to_string()))
            .bind(("token", lease.token.clone()))
            .bind(("now", millis(now)))
            .bind(("expires", millis(now + ttl)))
            .await
            .map_err(backend)?;
        let rows: Vec<DbLease> = take_rows(res)?;
        if let Some(row) = rows.into_iter().next() {
            return Ok(DeviceLease::from(row));
        }
        let holder = self
            .fetch_lease(&lease.device_id)
            .await?
            .filter(|l| !l.is_expired(now))
            .map(|l| l.holder)
            .unwrap_or_else(|| "nobody".to_string());
        Err(StorageError::LeaseHeld {
            device_id: lease.device_id.to_string(),
            holder,
        })
    }

    async fn holder(
        &self,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<DeviceLease>> {
        Ok(self
            .fetch_lease(device_id)
            .await?
            .filter(|l| !l.is_expired(now)))
    }
}

// ---------------------------------------------------------------------------
// PipelineLedger
// ---------------------------------------------------------------------------

#[async_trait]
impl PipelineLedger for SurrealStore {
    async fn create(&self, pipeline: PipelineRecord) -> StorageResult<PipelineRecord> {
        let row = DbPipeline::from_record(&pipeline)?;
        let id = pipeline.pipeline_id.to_string();
        let res = self
            .db
            .query("CREATE type::thing('pipelines', $id) CONTENT $row")
            .bind(("id", id.clone()))
            .bind(("row", row.clone()))
            .await
            .map_err(|e| write_err(&id, e))?;
        check_write(res, &id)?;
        row.try_into()
    }

    async fn record_transition(
        &self,
        pipeline_id: &PipelineId,
        expected_seq: u64,
        state: serde_json::Value,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageResult<PipelineRecord> {
        let current = PipelineLedger::get(self, pipeline_id).await?;
        let next = current.advanced(expected_seq, state, note, now)?;
        let row = DbPipeline::from_record(&next)?;
        let id = pipeline_id.to_string();
        let res = self
            .db
            .query("UPDATE type::thing('pipelines', $id) CONTENT $row WHERE seq = $expected RETURN AFTER")
            .bind(("id", id.clone()))
            .bind(("row", row))
            .bind(("expected", expected_seq as i64))
            .await
            .map_err(|e| write_err(&id, e))?;
        let rows: Vec<DbPipeline> = take_rows(res)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::conflict(id, format!("expected transition {expected_seq}")))?
            .try_into()
    }

    async fn get(&self, pipeline_id: &PipelineId) -> StorageResult<PipelineRecord> {
        let res = self
            .db
            .query("SELECT * FROM type::thing('pipelines', $id)")
            .bind(("id", pipeline_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbPipeline> = take_rows(res)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("pipeline", pipeline_id.as_str()))?
            .try_into()
    }

    async fn list(&self, device_id: Option<&DeviceId>) -> StorageResult<Vec<PipelineRecord>> {
        let res = match device_id {
            Some(device) => self
                .db
                .query("SELECT * FROM pipelines WHERE device_id = $device ORDER BY created_at DESC")
                .bind(("device", device.to_string()))
                .await
                .map_err(backend)?,
            None => self
                .db
                .query("SELECT * FROM pipelines ORDER BY created_at DESC")
                .await
                .map_err(backend)?,
        };
        let rows: Vec<DbPipeline> = take_rows(res)?;
        rows.into_iter().map(PipelineRecord::try_from).collect()
    }
}
