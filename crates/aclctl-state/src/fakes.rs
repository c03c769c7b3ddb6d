//! In-memory fakes for storage traits (testing and single-process runs)
//!
//! Provides one `Memory*` type per trait. Each fake applies the lifecycle
//! rules defined on the record types, so they satisfy the same contracts
//! as the SurrealDB backend without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryArtifactCache
// ---------------------------------------------------------------------------

/// Artifact cache backed by a `HashMap<fingerprint, artifact>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactCache {
    artifacts: Mutex<HashMap<String, ArtifactRecord>>,
}

impl MemoryArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactCache for MemoryArtifactCache {
    async fn get(&self, fingerprint: &PolicyFingerprint) -> StorageResult<Option<ArtifactRecord>> {
        let artifacts = self.artifacts.lock().unwrap();
        Ok(artifacts.get(fingerprint.as_str()).cloned())
    }

    async fn upsert(&self, artifact: ArtifactRecord) -> StorageResult<ArtifactRecord> {
        let mut artifacts = self.artifacts.lock().unwrap();
        artifacts.insert(artifact.fingerprint.as_str().to_string(), artifact.clone());
        Ok(artifact)
    }
}

// ---------------------------------------------------------------------------
// MemoryPolicyStore
// ---------------------------------------------------------------------------

/// Policy store keeping every version per identity.
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    versions: Mutex<HashMap<PolicyIdentity, Vec<PolicyRecord>>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn put(
        &self,
        identity: &PolicyIdentity,
        document: serde_json::Value,
        fingerprint: PolicyFingerprint,
    ) -> StorageResult<PolicyRecord> {
        let mut versions = self.versions.lock().unwrap();
        let entry = versions.entry(identity.clone()).or_default();
        if let Some(latest) = entry.last() {
            if latest.fingerprint == fingerprint {
                return Ok(latest.clone());
            }
        }
        let record = PolicyRecord {
            identity: identity.clone(),
            version: entry.len() as u64 + 1,
            document,
            fingerprint,
            updated_at: Utc::now(),
        };
        entry.push(record.clone());
        Ok(record)
    }

    async fn get(&self, identity: &PolicyIdentity) -> StorageResult<PolicyRecord> {
        let versions = self.versions.lock().unwrap();
        versions
            .get(identity)
            .and_then(|v| v.last())
            .cloned()
            .ok_or_else(|| StorageError::not_found("policy", identity.key()))
    }

    async fn get_version(
        &self,
        identity: &PolicyIdentity,
        version: u64,
    ) -> StorageResult<PolicyRecord> {
        let versions = self.versions.lock().unwrap();
        versions
            .get(identity)
            .and_then(|v| v.iter().find(|p| p.version == version))
            .cloned()
            .ok_or_else(|| {
                StorageError::not_found("policy", format!("{} v{}", identity.key(), version))
            })
    }

    async fn list(&self) -> StorageResult<Vec<PolicyRecord>> {
        let versions = self.versions.lock().unwrap();
        let mut latest: Vec<PolicyRecord> =
            versions.values().filter_map(|v| v.last().cloned()).collect();
        latest.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(latest)
    }
}

// ---------------------------------------------------------------------------
// MemoryDeviceRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryDeviceRegistry {
    devices: Mutex<HashMap<DeviceId, DeviceRecord>>,
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryDeviceRegistry {
    async fn upsert(&self, mut device: DeviceRecord) -> StorageResult<DeviceRecord> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(existing) = devices.get(&device.device_id) {
            device.current_revision = existing.current_revision.clone();
        }
        devices.insert(device.device_id.clone(), device.clone());
        Ok(device)
    }

    async fn get(&self, device_id: &DeviceId) -> StorageResult<DeviceRecord> {
        let devices = self.devices.lock().unwrap();
        devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("device", device_id.as_str()))
    }

    async fn list(&self) -> StorageResult<Vec<DeviceRecord>> {
        let devices = self.devices.lock().unwrap();
        let mut all: Vec<DeviceRecord> = devices.values().cloned().collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(all)
    }

    async fn set_current_revision(
        &self,
        device_id: &DeviceId,
        revision: &RevisionRecord,
    ) -> StorageResult<DeviceRecord> {
        check_pointer_target(device_id, revision)?;
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| StorageError::not_found("device", device_id.as_str()))?;
        device.current_revision = Some(revision.revision_id.clone());
        Ok(device.clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryRevisionStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RevisionState {
    by_id: HashMap<RevisionId, RevisionRecord>,
    /// Revision ids per (device, policy), in seq order
    chains: HashMap<(DeviceId, PolicyIdentity), Vec<RevisionId>>,
}

/// Revision ledger; one mutex makes seq assignment atomic.
#[derive(Debug, Default)]
pub struct MemoryRevisionStore {
    state: Mutex<RevisionState>,
}

impl MemoryRevisionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevisionStore for MemoryRevisionStore {
    async fn append(
        &self,
        revision: NewRevision,
        expected_prev_seq: u64,
        now: DateTime<Utc>,
    ) -> StorageResult<RevisionRecord> {
        let mut state = self.state.lock().unwrap();
        let key = (revision.device_id.clone(), revision.policy.clone());
        let current = state.chains.get(&key).map(|c| c.len() as u64).unwrap_or(0);
        if current != expected_prev_seq {
            return Err(StorageError::conflict(
                ledger_key(&revision.device_id, &revision.policy),
                format!("expected seq {expected_prev_seq}, found {current}"),
            ));
        }
        let record = RevisionRecord {
            revision_id: RevisionId::new(),
            device_id: revision.device_id,
            policy: revision.policy,
            fingerprint: revision.fingerprint,
            seq: current + 1,
            status: revision.status,
            created_at: now,
            updated_at: now,
        };
        state
            .chains
            .entry(key)
            .or_default()
            .push(record.revision_id.clone());
        state
            .by_id
            .insert(record.revision_id.clone(), record.clone());
        Ok(record)
    }

    async fn latest(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> StorageResult<Option<RevisionRecord>> {
        let state = self.state.lock().unwrap();
        let key = (device_id.clone(), policy.clone());
        Ok(state
            .chains
            .get(&key)
            .and_then(|c| c.last())
            .and_then(|id| state.by_id.get(id))
            .cloned())
    }

    async fn get(&self, revision_id: &RevisionId) -> StorageResult<RevisionRecord> {
        let state = self.state.lock().unwrap();
        state
            .by_id
            .get(revision_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("revision", revision_id.as_str()))
    }

    async fn history(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> StorageResult<Vec<RevisionRecord>> {
        let state = self.state.lock().unwrap();
        let key = (device_id.clone(), policy.clone());
        Ok(state
            .chains
            .get(&key)
            .map(|c| {
                c.iter()
                    .rev()
                    .filter_map(|id| state.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn transition(
        &self,
        revision_id: &RevisionId,
        to: RevisionStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<RevisionRecord> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .by_id
            .get(revision_id)
            .ok_or_else(|| StorageError::not_found("revision", revision_id.as_str()))?;
        match current.transition(to, now)? {
            None => Ok(current.clone()),
            Some(next) => {
                state.by_id.insert(revision_id.clone(), next.clone());
                Ok(next)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryJobQueue
// ---------------------------------------------------------------------------

/// Job queue backed by a `Vec` in enqueue order.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<JobRecord>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StorageResult<JobRecord> {
        let record = JobRecord::new(job, now);
        self.jobs.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn claim(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> StorageResult<Option<JobRecord>> {
        let mut jobs = self.jobs.lock().unwrap();
        let next = jobs
            .iter_mut()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| j.ready_at);
        Ok(next.map(|job| {
            *job = job.claimed(worker, now, visibility);
            job.clone()
        }))
    }

    async fn finish(
        &self,
        claimed: &JobRecord,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<JobRecord> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.job_id == claimed.job_id)
            .ok_or_else(|| StorageError::not_found("job", claimed.job_id.as_str()))?;
        if job.version != claimed.version {
            return Err(StorageError::conflict(
                claimed.job_id.to_string(),
                "claim superseded",
            ));
        }
        *job = job.finished(outcome, now)?;
        Ok(job.clone())
    }

    async fn cancel(&self, job_id: &JobId, now: DateTime<Utc>) -> StorageResult<JobRecord> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| &j.job_id == job_id)
            .ok_or_else(|| StorageError::not_found("job", job_id.as_str()))?;
        *job = job.cancel_requested(now)?;
        Ok(job.clone())
    }

    async fn get(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        let jobs = self.jobs.lock().unwrap();
        jobs.iter()
            .find(|j| &j.job_id == job_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("job", job_id.as_str()))
    }

    async fn list(&self, state: Option<JobState>) -> StorageResult<Vec<JobRecord>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .iter()
            .filter(|j| state.map(|s| j.state == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn outstanding(&self) -> StorageResult<usize> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.iter().filter(|j| !j.state.is_terminal()).count())
    }
}

// ---------------------------------------------------------------------------
// MemoryDeviceLeases
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryDeviceLeases {
    leases: Mutex<HashMap<DeviceId, DeviceLease>>,
}

impl MemoryDeviceLeases {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceLeases for MemoryDeviceLeases {
    async fn try_acquire(
        &self,
        device_id: &DeviceId,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<Option<DeviceLease>> {
        let mut leases = self.leases.lock().unwrap();
        if let Some(existing) = leases.get(device_id) {
            if !existing.is_expired(now) {
                return Ok(None);
            }
        }
        let lease = DeviceLease::new(device_id, holder, now, ttl);
        leases.insert(device_id.clone(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &DeviceLease) -> StorageResult<()> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(&lease.device_id) {
            None => Ok(()),
            Some(current) if current.token == lease.token => {
                leases.remove(&lease.device_id);
                Ok(())
            }
            Some(current) => Err(StorageError::LeaseHeld {
                device_id: lease.device_id.to_string(),
                holder: current.holder.clone(),
            }),
        }
    }

    async fn renew(
        &self,
        lease: &DeviceLease,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<DeviceLease> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(&lease.device_id) {
            Some(current) if current.token == lease.token && !current.is_expired(now) => {
                current.expires_at = now + ttl;
                Ok(current.clone())
            }
            current => Err(StorageError::LeaseHeld {
                device_id: lease.device_id.to_string(),
                holder: current
                    .filter(|c| !c.is_expired(now))
                    .map(|c| c.holder.clone())
                    .unwrap_or_else(|| "nobody".to_string()),
            }),
        }
    }

    async fn holder(
        &self,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<DeviceLease>> {
        let leases = self.leases.lock().unwrap();
        Ok(leases
            .get(device_id)
            .filter(|l| !l.is_expired(now))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryPipelineLedger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryPipelineLedger {
    pipelines: Mutex<Vec<PipelineRecord>>,
}

impl MemoryPipelineLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineLedger for MemoryPipelineLedger {
    async fn create(&self, pipeline: PipelineRecord) -> StorageResult<PipelineRecord> {
        let mut pipelines = self.pipelines.lock().unwrap();
        if pipelines
            .iter()
            .any(|p| p.pipeline_id == pipeline.pipeline_id)
        {
            return Err(StorageError::conflict(
                pipeline.pipeline_id.to_string(),
                "pipeline already exists",
            ));
        }
        pipelines.push(pipeline.clone());
        Ok(pipeline)
    }

    async fn record_transition(
        &self,
        pipeline_id: &PipelineId,
        expected_seq: u64,
        state: serde_json::Value,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageResult<PipelineRecord> {
        let mut pipelines = self.pipelines.lock().unwrap();
        let pipeline = pipelines
            .iter_mut()
            .find(|p| &p.pipeline_id == pipeline_id)
            .ok_or_else(|| StorageError::not_found("pipeline", pipeline_id.as_str()))?;
        *pipeline = pipeline.advanced(expected_seq, state, note, now)?;
        Ok(pipeline.clone())
    }

    async fn get(&self, pipeline_id: &PipelineId) -> StorageResult<PipelineRecord> {
        let pipelines = self.pipelines.lock().unwrap();
        pipelines
            .iter()
            .find(|p| &p.pipeline_id == pipeline_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("pipeline", pipeline_id.as_str()))
    }

    async fn list(&self, device_id: Option<&DeviceId>) -> StorageResult<Vec<PipelineRecord>> {
        let pipelines = self.pipelines.lock().unwrap();
        Ok(pipelines
            .iter()
            .rev()
            .filter(|p| device_id.map(|d| &p.device_id == d).unwrap_or(true))
            .cloned()
            .collect())
    }
}
