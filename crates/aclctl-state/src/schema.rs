//! Row types for the SurrealDB tables
//!
//! Tables:
//! - artifacts: compiled artifacts keyed by fingerprint
//! - policies: one row per policy version
//! - devices: managed devices
//! - revisions: append-only ledger entries
//! - jobs: queued work
//! - leases: device locks
//! - pipelines: pipeline state and transition history
//!
//! Timestamps are stored as epoch milliseconds so range predicates compare
//! numerically. Free-form JSON (policy documents, job payloads, pipeline
//! states) is stored as serialized text and decoded at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::*;

pub(crate) fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn digest(s: String) -> StorageResult<ContentDigest> {
    ContentDigest::try_from(s)
}

fn decode(field: &str, s: &str) -> StorageResult<serde_json::Value> {
    serde_json::from_str(s).map_err(|e| StorageError::Serialization(format!("{field}: {e}")))
}

// ---------------------------------------------------------------------------
// artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbArtifact {
    pub fingerprint: String,
    pub policy_key: String,
    pub policy_name: String,
    pub platform: String,
    pub filter_name: String,
    pub config_text: String,
    pub diagnostics: Vec<String>,
    pub coverage_score: f64,
    pub uncovered_terms: Vec<String>,
    pub compiled_at: i64,
}

impl From<&ArtifactRecord> for DbArtifact {
    fn from(a: &ArtifactRecord) -> Self {
        Self {
            fingerprint: a.fingerprint.as_str().to_string(),
            policy_key: a.policy.key(),
            policy_name: a.policy.name.clone(),
            platform: a.policy.platform.clone(),
            filter_name: a.filter_name.clone(),
            config_text: a.config_text.clone(),
            diagnostics: a.diagnostics.clone(),
            coverage_score: a.coverage_score,
            uncovered_terms: a.uncovered_terms.clone(),
            compiled_at: millis(a.compiled_at),
        }
    }
}

impl TryFrom<DbArtifact> for ArtifactRecord {
    type Error = StorageError;

    fn try_from(row: DbArtifact) -> StorageResult<Self> {
        Ok(ArtifactRecord {
            fingerprint: digest(row.fingerprint)?,
            policy: PolicyIdentity::new(row.policy_name, row.platform),
            filter_name: row.filter_name,
            config_text: row.config_text,
            diagnostics: row.diagnostics,
            coverage_score: row.coverage_score,
            uncovered_terms: row.uncovered_terms,
            compiled_at: from_millis(row.compiled_at),
        })
    }
}

// ---------------------------------------------------------------------------
// policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbPolicy {
    pub policy_key: String,
    pub name: String,
    pub platform: String,
    pub version: i64,
    pub document: String,
    pub fingerprint: String,
    pub updated_at: i64,
}

impl DbPolicy {
    pub fn from_record(p: &PolicyRecord) -> StorageResult<Self> {
        Ok(Self {
            policy_key: p.identity.key(),
            name: p.identity.name.clone(),
            platform: p.identity.platform.clone(),
            version: p.version as i64,
            document: serde_json::to_string(&p.document)?,
            fingerprint: p.fingerprint.as_str().to_string(),
            updated_at: millis(p.updated_at),
        })
    }
}

impl TryFrom<DbPolicy> for PolicyRecord {
    type Error = StorageError;

    fn try_from(row: DbPolicy) -> StorageResult<Self> {
        Ok(PolicyRecord {
            document: decode("document", &row.document)?,
            identity: PolicyIdentity::new(row.name, row.platform),
            version: row.version as u64,
            fingerprint: digest(row.fingerprint)?,
            updated_at: from_millis(row.updated_at),
        })
    }
}

// ---------------------------------------------------------------------------
// devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbDevice {
    pub device_id: String,
    pub address: String,
    pub port: Option<i64>,
    pub credential_ref: String,
    pub platform: String,
    pub current_revision: Option<String>,
}

impl From<&DeviceRecord> for DbDevice {
    fn from(d: &DeviceRecord) -> Self {
        Self {
            device_id: d.device_id.to_string(),
            address: d.address.clone(),
            port: d.port.map(i64::from),
            credential_ref: d.credential_ref.clone(),
            platform: d.platform.clone(),
            current_revision: d.current_revision.as_ref().map(|r| r.to_string()),
        }
    }
}

impl From<DbDevice> for DeviceRecord {
    fn from(row: DbDevice) -> Self {
        DeviceRecord {
            device_id: DeviceId(row.device_id),
            address: row.address,
            port: row.port.and_then(|p| u16::try_from(p).ok()),
            credential_ref: row.credential_ref,
            platform: row.platform,
            current_revision: row.current_revision.map(RevisionId),
        }
    }
}

// ---------------------------------------------------------------------------
// revisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbRevision {
    pub revision_id: String,
    pub device_id: String,
    pub policy_key: String,
    pub policy_name: String,
    pub platform: String,
    pub fingerprint: String,
    pub seq: i64,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&RevisionRecord> for DbRevision {
    fn from(r: &RevisionRecord) -> Self {
        Self {
            revision_id: r.revision_id.to_string(),
            device_id: r.device_id.to_string(),
            policy_key: r.policy.key(),
            policy_name: r.policy.name.clone(),
            platform: r.policy.platform.clone(),
            fingerprint: r.fingerprint.as_str().to_string(),
            seq: r.seq as i64,
            status: r.status.as_str().to_string(),
            created_at: millis(r.created_at),
            updated_at: millis(r.updated_at),
        }
    }
}

impl TryFrom<DbRevision> for RevisionRecord {
    type Error = StorageError;

    fn try_from(row: DbRevision) -> StorageResult<Self> {
        let status = RevisionStatus::parse(&row.status).ok_or_else(|| {
            StorageError::Serialization(format!("unknown revision status '{}'", row.status))
        })?;
        Ok(RevisionRecord {
            revision_id: RevisionId(row.revision_id),
            device_id: DeviceId(row.device_id),
            policy: PolicyIdentity::new(row.policy_name, row.platform),
            fingerprint: digest(row.fingerprint)?,
            seq: row.seq as u64,
            status,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbJob {
    pub job_id: String,
    pub kind: String,
    pub pipeline_ids: Vec<String>,
    pub payload: String,
    pub state: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub ready_at: i64,
    pub lease_expires_at: Option<i64>,
    pub worker: Option<String>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub output: String,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DbJob {
    pub fn from_record(j: &JobRecord) -> StorageResult<Self> {
        Ok(Self {
            job_id: j.job_id.to_string(),
            kind: j.kind.as_str().to_string(),
            pipeline_ids: j.pipeline_ids.iter().map(|p| p.to_string()).collect(),
            payload: serde_json::to_string(&j.payload)?,
            state: j.state.as_str().to_string(),
            attempts: i64::from(j.attempts),
            max_attempts: i64::from(j.max_attempts),
            ready_at: millis(j.ready_at),
            lease_expires_at: j.lease_expires_at.map(millis),
            worker: j.worker.clone(),
            cancel_requested: j.cancel_requested,
            last_error: j.last_error.clone(),
            output: serde_json::to_string(&j.output)?,
            version: j.version as i64,
            created_at: millis(j.created_at),
            updated_at: millis(j.updated_at),
        })
    }
}

impl TryFrom<DbJob> for JobRecord {
    type Error = StorageError;

    fn try_from(row: DbJob) -> StorageResult<Self> {
        let kind = JobKind::parse(&row.kind)
            .ok_or_else(|| StorageError::Serialization(format!("unknown job kind '{}'", row.kind)))?;
        let state = JobState::parse(&row.state).ok_or_else(|| {
            StorageError::Serialization(format!("unknown job state '{}'", row.state))
        })?;
        Ok(JobRecord {
            payload: decode("payload", &row.payload)?,
            output: decode("output", &row.output)?,
            job_id: JobId(row.job_id),
            kind,
            pipeline_ids: row.pipeline_ids.into_iter().map(PipelineId).collect(),
            state,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            ready_at: from_millis(row.ready_at),
            lease_expires_at: row.lease_expires_at.map(from_millis),
            worker: row.worker,
            cancel_requested: row.cancel_requested,
            last_error: row.last_error,
            version: row.version as u64,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

// ---------------------------------------------------------------------------
// leases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbLease {
    pub device_id: String,
    pub holder: String,
    pub token: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl From<&DeviceLease> for DbLease {
    fn from(l: &DeviceLease) -> Self {
        Self {
            device_id: l.device_id.to_string(),
            holder: l.holder.clone(),
            token: l.token.clone(),
            acquired_at: millis(l.acquired_at),
            expires_at: millis(l.expires_at),
        }
    }
}

impl From<DbLease> for DeviceLease {
    fn from(row: DbLease) -> Self {
        DeviceLease {
            device_id: DeviceId(row.device_id),
            holder: row.holder,
            token: row.token,
            acquired_at: from_millis(row.acquired_at),
            expires_at: from_millis(row.expires_at),
        }
    }
}

// ---------------------------------------------------------------------------
// pipelines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbPipeline {
    pub pipeline_id: String,
    pub policy_name: String,
    pub platform: String,
    pub device_id: String,
    pub state: String,
    pub transitions: String,
    /// Latest transition seq, duplicated out of `transitions` for CAS
    pub seq: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DbPipeline {
    pub fn from_record(p: &PipelineRecord) -> StorageResult<Self> {
        Ok(Self {
            pipeline_id: p.pipeline_id.to_string(),
            policy_name: p.policy.name.clone(),
            platform: p.policy.platform.clone(),
            device_id: p.device_id.to_string(),
            state: serde_json::to_string(&p.state)?,
            transitions: serde_json::to_string(&p.transitions)?,
            seq: p.seq() as i64,
            created_at: millis(p.created_at),
            updated_at: millis(p.updated_at),
        })
    }
}

impl TryFrom<DbPipeline> for PipelineRecord {
    type Error = StorageError;

    fn try_from(row: DbPipeline) -> StorageResult<Self> {
        let transitions: Vec<PipelineTransition> = serde_json::from_str(&row.transitions)
            .map_err(|e| StorageError::Serialization(format!("transitions: {e}")))?;
        Ok(PipelineRecord {
            state: decode("state", &row.state)?,
            pipeline_id: PipelineId(row.pipeline_id),
            policy: PolicyIdentity::new(row.policy_name, row.platform),
            device_id: DeviceId(row.device_id),
            transitions,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}
