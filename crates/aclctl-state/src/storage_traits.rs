//! Storage trait definitions for aclctl
//!
//! These traits define the persistence seams of the pipeline:
//! - `ArtifactCache`: compiled artifacts keyed by policy fingerprint
//! - `PolicyStore`: versioned policy documents
//! - `DeviceRegistry`: managed devices and their current-deployed pointer
//! - `RevisionStore`: append-only, gapless revision ledger per (device, policy)
//! - `JobQueue`: durable at-least-once job queue with visibility timeout
//! - `DeviceLeases`: per-device mutual exclusion with expiry
//! - `PipelineLedger`: per-(policy, device) pipeline state history
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module. Lifecycle rules that every backend
//! must enforce live on the record types here so fakes and the SurrealDB
//! backend share one implementation of them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Digest over a policy's normalized content and platform.
pub type PolicyFingerprint = ContentDigest;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random identifier
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Operator-assigned device name (e.g. `edge-1`)
    DeviceId
);
string_id!(
    /// Identifier of one revision ledger entry
    RevisionId
);
string_id!(
    /// Identifier of a queued job
    JobId
);
string_id!(
    /// Identifier of one (policy, device) pipeline instance
    PipelineId
);

/// Identity of a policy: (name, platform)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyIdentity {
    pub name: String,
    pub platform: String,
}

impl PolicyIdentity {
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
        }
    }

    /// Stable single-string key, `name@platform`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.platform)
    }
}

impl std::fmt::Display for PolicyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.platform)
    }
}

// ---------------------------------------------------------------------------
// ArtifactCache: compiled output keyed by fingerprint
// ---------------------------------------------------------------------------

/// Compiled output for one fingerprint. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub fingerprint: PolicyFingerprint,
    pub policy: PolicyIdentity,
    /// Name of the filter/ACL object the config defines
    pub filter_name: String,
    /// Rendered device configuration
    pub config_text: String,
    /// Compiler warnings, verbatim
    pub diagnostics: Vec<String>,
    /// Coverage percentage in `[0, 100]`
    pub coverage_score: f64,
    /// Terms not exercised by the policy's test cases
    pub uncovered_terms: Vec<String>,
    pub compiled_at: DateTime<Utc>,
}

/// Content-addressed cache of compiled artifacts.
///
/// Guarantees:
/// - `upsert` is a single idempotent write keyed by fingerprint; concurrent
///   writers converge on one stored artifact (last writer wins).
/// - `get` never returns an artifact for a different fingerprint.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Look up a cached artifact.
    async fn get(&self, fingerprint: &PolicyFingerprint) -> StorageResult<Option<ArtifactRecord>>;

    /// Store an artifact and return what is now stored under its fingerprint.
    async fn upsert(&self, artifact: ArtifactRecord) -> StorageResult<ArtifactRecord>;
}

// ---------------------------------------------------------------------------
// PolicyStore: versioned policy documents
// ---------------------------------------------------------------------------

/// One stored version of a policy document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub identity: PolicyIdentity,
    /// 1-based, bumped whenever the fingerprint changes
    pub version: u64,
    pub document: serde_json::Value,
    pub fingerprint: PolicyFingerprint,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Store a document. A new version is created only when the fingerprint
    /// differs from the latest version; otherwise the latest is returned.
    async fn put(
        &self,
        identity: &PolicyIdentity,
        document: serde_json::Value,
        fingerprint: PolicyFingerprint,
    ) -> StorageResult<PolicyRecord>;

    /// Latest version. Returns `StorageError::NotFound` if absent.
    async fn get(&self, identity: &PolicyIdentity) -> StorageResult<PolicyRecord>;

    /// A specific version.
    async fn get_version(
        &self,
        identity: &PolicyIdentity,
        version: u64,
    ) -> StorageResult<PolicyRecord>;

    /// Latest version of every policy, ordered by identity.
    async fn list(&self) -> StorageResult<Vec<PolicyRecord>>;
}

// ---------------------------------------------------------------------------
// DeviceRegistry
// ---------------------------------------------------------------------------

/// A managed network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub address: String,
    pub port: Option<u16>,
    /// Handle resolved by a credential store; never the secret itself
    pub credential_ref: String,
    pub platform: String,
    /// Last revision successfully deployed, if any
    pub current_revision: Option<RevisionId>,
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Register or update a device. The current-deployed pointer of an
    /// existing device is preserved.
    async fn upsert(&self, device: DeviceRecord) -> StorageResult<DeviceRecord>;

    async fn get(&self, device_id: &DeviceId) -> StorageResult<DeviceRecord>;

    async fn list(&self) -> StorageResult<Vec<DeviceRecord>>;

    /// Advance the current-deployed pointer. Fails with
    /// `InvalidTransition` unless `revision` is `deployed` and belongs to
    /// the device.
    async fn set_current_revision(
        &self,
        device_id: &DeviceId,
        revision: &RevisionRecord,
    ) -> StorageResult<DeviceRecord>;
}

/// Shared guard for `set_current_revision`.
pub fn check_pointer_target(device_id: &DeviceId, revision: &RevisionRecord) -> StorageResult<()> {
    if &revision.device_id != device_id || revision.status != RevisionStatus::Deployed {
        return Err(StorageError::InvalidTransition {
            id: device_id.to_string(),
            from: "current_revision".to_string(),
            to: format!("{} ({})", revision.revision_id, revision.status),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RevisionStore: append-only ledger
// ---------------------------------------------------------------------------

/// Revision lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionStatus {
    Pending,
    Approved,
    Deployed,
    RolledBack,
}

impl RevisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevisionStatus::Pending => "pending",
            RevisionStatus::Approved => "approved",
            RevisionStatus::Deployed => "deployed",
            RevisionStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RevisionStatus::Pending),
            "approved" => Some(RevisionStatus::Approved),
            "deployed" => Some(RevisionStatus::Deployed),
            "rolled_back" => Some(RevisionStatus::RolledBack),
            _ => None,
        }
    }

    /// `deployed` and `rolled_back` are final.
    pub fn is_final(&self) -> bool {
        matches!(self, RevisionStatus::Deployed | RevisionStatus::RolledBack)
    }

    pub fn can_transition_to(&self, to: RevisionStatus) -> bool {
        matches!(
            (self, to),
            (RevisionStatus::Pending, RevisionStatus::Approved)
                | (RevisionStatus::Approved, RevisionStatus::Deployed)
                | (RevisionStatus::Approved, RevisionStatus::RolledBack)
        )
    }
}

impl std::fmt::Display for RevisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger entry binding a device, a policy and an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub revision_id: RevisionId,
    pub device_id: DeviceId,
    pub policy: PolicyIdentity,
    /// Artifact reference; the artifact itself lives in the cache
    pub fingerprint: PolicyFingerprint,
    /// 1-based, gapless per (device, policy)
    pub seq: u64,
    pub status: RevisionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RevisionRecord {
    /// Apply a status change.
    ///
    /// Returns `Ok(None)` when the record is already in `to` (idempotent
    /// no-op), `Ok(Some(updated))` for a permitted change.
    pub fn transition(
        &self,
        to: RevisionStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<RevisionRecord>> {
        if self.status == to {
            return Ok(None);
        }
        if !self.status.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                id: self.revision_id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let mut next = self.clone();
        next.status = to;
        next.updated_at = now;
        Ok(Some(next))
    }
}

/// Input to `RevisionStore::append`
#[derive(Debug, Clone)]
pub struct NewRevision {
    pub device_id: DeviceId,
    pub policy: PolicyIdentity,
    pub fingerprint: PolicyFingerprint,
    pub status: RevisionStatus,
}

/// Ledger key used in conflict errors
pub fn ledger_key(device_id: &DeviceId, policy: &PolicyIdentity) -> String {
    format!("{}/{}", device_id, policy.key())
}

/// Append-only revision ledger.
///
/// Guarantees:
/// - `append` assigns `expected_prev_seq + 1` atomically and fails with
///   `Conflict` when the latest stored seq differs from `expected_prev_seq`.
/// - Records in a final status never change.
#[async_trait]
pub trait RevisionStore: Send + Sync {
    async fn append(
        &self,
        revision: NewRevision,
        expected_prev_seq: u64,
        now: DateTime<Utc>,
    ) -> StorageResult<RevisionRecord>;

    /// Highest-seq revision for the pair, if any.
    async fn latest(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> StorageResult<Option<RevisionRecord>>;

    async fn get(&self, revision_id: &RevisionId) -> StorageResult<RevisionRecord>;

    /// All revisions for the pair, newest first.
    async fn history(
        &self,
        device_id: &DeviceId,
        policy: &PolicyIdentity,
    ) -> StorageResult<Vec<RevisionRecord>>;

    /// Change status following `RevisionRecord::transition` rules.
    async fn transition(
        &self,
        revision_id: &RevisionId,
        to: RevisionStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<RevisionRecord>;
}

// ---------------------------------------------------------------------------
// JobQueue: durable at-least-once queue
// ---------------------------------------------------------------------------

/// Job kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Deploy,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Build => "build",
            JobKind::Deploy => "deploy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "build" => Some(JobKind::Build),
            "deploy" => Some(JobKind::Deploy),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Dead,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            "dead" => Some(JobState::Dead),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to `JobQueue::enqueue`
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub pipeline_ids: Vec<PipelineId>,
    pub max_attempts: u32,
    /// Earliest time a worker may claim the job
    pub ready_at: DateTime<Utc>,
}

/// How a worker finished with a claimed job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded { output: serde_json::Value },
    /// Terminal failure, never retried
    Failed {
        error: String,
        output: serde_json::Value,
    },
    /// Transient failure; retried at `ready_at` or moved to `dead` once
    /// `max_attempts` is reached
    Retry {
        error: String,
        ready_at: DateTime<Utc>,
    },
    /// Put back without consuming an attempt
    Requeue { ready_at: DateTime<Utc> },
    Cancelled,
}

/// A unit of queued work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub kind: JobKind,
    pub pipeline_ids: Vec<PipelineId>,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Claims that counted against `max_attempts`
    pub attempts: u32,
    pub max_attempts: u32,
    pub ready_at: DateTime<Utc>,
    /// Visibility deadline of the current claim
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker: Option<String>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub output: serde_json::Value,
    /// Bumped on every write; used for compare-and-set
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId::new(),
            kind: job.kind,
            pipeline_ids: job.pipeline_ids,
            payload: job.payload,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: job.max_attempts.max(1),
            ready_at: job.ready_at,
            lease_expires_at: None,
            worker: None,
            cancel_requested: false,
            last_error: None,
            output: serde_json::Value::Null,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Queued and due, or running with an expired visibility lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Queued => self.ready_at <= now,
            JobState::Running => self.lease_expires_at.map(|t| t <= now).unwrap_or(true),
            _ => false,
        }
    }

    /// The record after `worker` claims it.
    pub fn claimed(&self, worker: &str, now: DateTime<Utc>, visibility: Duration) -> JobRecord {
        let mut next = self.clone();
        next.state = JobState::Running;
        next.attempts += 1;
        next.worker = Some(worker.to_string());
        next.lease_expires_at = Some(now + visibility);
        next.version += 1;
        next.updated_at = now;
        next
    }

    /// The record after the claimant reports `outcome`.
    pub fn finished(&self, outcome: JobOutcome, now: DateTime<Utc>) -> StorageResult<JobRecord> {
        if self.state != JobState::Running {
            return Err(StorageError::InvalidTransition {
                id: self.job_id.to_string(),
                from: self.state.to_string(),
                to: "finished".to_string(),
            });
        }
        let mut next = self.clone();
        next.lease_expires_at = None;
        next.worker = None;
        next.version += 1;
        next.updated_at = now;
        match outcome {
            JobOutcome::Succeeded { output } => {
                next.state = JobState::Succeeded;
                next.output = output;
            }
            JobOutcome::Failed { error, output } => {
                next.state = JobState::Failed;
                next.last_error = Some(error);
                next.output = output;
            }
            JobOutcome::Retry { error, ready_at } => {
                next.last_error = Some(error);
                if next.attempts >= next.max_attempts {
                    next.state = JobState::Dead;
                } else {
                    next.state = JobState::Queued;
                    next.ready_at = ready_at;
                }
            }
            JobOutcome::Requeue { ready_at } => {
                next.state = JobState::Queued;
                next.attempts = next.attempts.saturating_sub(1);
                next.ready_at = ready_at;
            }
            JobOutcome::Cancelled => {
                next.state = JobState::Cancelled;
            }
        }
        Ok(next)
    }

    /// The record after a cancellation request.
    ///
    /// Queued jobs are cancelled immediately; running jobs are flagged and
    /// the worker honours the flag after its current remote operation.
    pub fn cancel_requested(&self, now: DateTime<Utc>) -> StorageResult<JobRecord> {
        let mut next = self.clone();
        match self.state {
            JobState::Queued => next.state = JobState::Cancelled,
            JobState::Running => next.cancel_requested = true,
            _ => {
                return Err(StorageError::InvalidTransition {
                    id: self.job_id.to_string(),
                    from: self.state.to_string(),
                    to: JobState::Cancelled.to_string(),
                })
            }
        }
        next.version += 1;
        next.updated_at = now;
        Ok(next)
    }
}

/// Durable at-least-once job queue.
///
/// Guarantees:
/// - A job is held by at most one claimant at a time; a claim whose
///   visibility lease expires may be taken over by another worker.
/// - `finish` succeeds only for the holder of the latest claim
///   (`Conflict` otherwise).
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StorageResult<JobRecord>;

    /// Claim the oldest due job, if any.
    async fn claim(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> StorageResult<Option<JobRecord>>;

    /// Report the outcome of a claim previously returned by `claim`.
    async fn finish(
        &self,
        claimed: &JobRecord,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<JobRecord>;

    async fn cancel(&self, job_id: &JobId, now: DateTime<Utc>) -> StorageResult<JobRecord>;

    async fn get(&self, job_id: &JobId) -> StorageResult<JobRecord>;

    /// Jobs in `state` (all when `None`), oldest first.
    async fn list(&self, state: Option<JobState>) -> StorageResult<Vec<JobRecord>>;

    /// Number of queued or running jobs.
    async fn outstanding(&self) -> StorageResult<usize>;
}

// ---------------------------------------------------------------------------
// DeviceLeases: per-device mutual exclusion
// ---------------------------------------------------------------------------

/// A time-bounded exclusive hold on a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLease {
    pub device_id: DeviceId,
    pub holder: String,
    /// Distinguishes successive holds by the same holder
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DeviceLease {
    pub fn new(device_id: &DeviceId, holder: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            device_id: device_id.clone(),
            holder: holder.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Externally arbitrated device locks.
///
/// Guarantees:
/// - At most one unexpired lease exists per device.
/// - An expired lease may be taken over, so a crashed holder never locks a
///   device forever.
#[async_trait]
pub trait DeviceLeases: Send + Sync {
    /// Acquire the lease, or `None` if another unexpired lease exists.
    async fn try_acquire(
        &self,
        device_id: &DeviceId,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<Option<DeviceLease>>;

    /// Release a lease. No-op if it is already gone; `LeaseHeld` if the
    /// device is now held under a different token.
    async fn release(&self, lease: &DeviceLease) -> StorageResult<()>;

    /// Extend a held lease to `now + ttl`. `LeaseHeld` if the lease expired,
    /// was released or was taken over under another token.
    async fn renew(
        &self,
        lease: &DeviceLease,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<DeviceLease>;

    /// Current unexpired lease, if any.
    async fn holder(
        &self,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<DeviceLease>>;
}

// ---------------------------------------------------------------------------
// PipelineLedger: per-(policy, device) state history
// ---------------------------------------------------------------------------

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTransition {
    /// 1-based position in the pipeline's history
    pub seq: u64,
    pub state: serde_json::Value,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// A pipeline instance and its transition history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub pipeline_id: PipelineId,
    pub policy: PolicyIdentity,
    pub device_id: DeviceId,
    /// Current state, as serialized by the coordinator
    pub state: serde_json::Value,
    pub transitions: Vec<PipelineTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRecord {
    pub fn new(
        policy: PolicyIdentity,
        device_id: DeviceId,
        initial: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pipeline_id: PipelineId::new(),
            policy,
            device_id,
            state: initial.clone(),
            transitions: vec![PipelineTransition {
                seq: 1,
                state: initial,
                note: None,
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    /// Seq of the latest transition.
    pub fn seq(&self) -> u64 {
        self.transitions.last().map(|t| t.seq).unwrap_or(0)
    }

    /// The record after appending a transition, checking `expected_seq`.
    pub fn advanced(
        &self,
        expected_seq: u64,
        state: serde_json::Value,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageResult<PipelineRecord> {
        let current = self.seq();
        if current != expected_seq {
            return Err(StorageError::conflict(
                self.pipeline_id.to_string(),
                format!("expected transition {expected_seq}, found {current}"),
            ));
        }
        let mut next = self.clone();
        next.transitions.push(PipelineTransition {
            seq: current + 1,
            state: state.clone(),
            note,
            at: now,
        });
        next.state = state;
        next.updated_at = now;
        Ok(next)
    }
}

#[async_trait]
pub trait PipelineLedger: Send + Sync {
    async fn create(&self, pipeline: PipelineRecord) -> StorageResult<PipelineRecord>;

    /// Append a transition; `Conflict` if the latest seq is not `expected_seq`.
    async fn record_transition(
        &self,
        pipeline_id: &PipelineId,
        expected_seq: u64,
        state: serde_json::Value,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageResult<PipelineRecord>;

    async fn get(&self, pipeline_id: &PipelineId) -> StorageResult<PipelineRecord>;

    /// Pipelines, newest first, optionally for one device.
    async fn list(&self, device_id: Option<&DeviceId>) -> StorageResult<Vec<PipelineRecord>>;
}
