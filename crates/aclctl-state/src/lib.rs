//! aclctl-state: persistence for the ACL deployment pipeline
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durable records and the concurrency guarantees the pipeline
//! builds on (gapless revision sequences, single-claimant jobs, expiring
//! device leases).
//!
//! ## Key Components
//!
//! - `storage_traits`: backend-agnostic async traits and record types
//! - `fakes`: in-memory implementations for tests and single-process runs
//! - `SurrealStore`: SurrealDB implementation of every trait
//! - `SurrealHandle` / `CloudConfig`: connection setup and schema migrations
//! - `Stores`: the bundle of trait objects consumed by `aclctl-core`

mod error;
pub mod fakes;
mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
mod stores;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{CloudConfig, SurrealHandle};
pub use storage_traits::{
    ArtifactCache, ArtifactRecord, ContentDigest, DeviceId, DeviceLease, DeviceLeases,
    DeviceRecord, DeviceRegistry, JobId, JobKind, JobOutcome, JobQueue, JobRecord, JobState,
    NewJob, NewRevision, PipelineId, PipelineLedger, PipelineRecord, PipelineTransition,
    PolicyFingerprint, PolicyIdentity, PolicyRecord, PolicyStore, RevisionId, RevisionRecord,
    RevisionStatus, RevisionStore, StorageResult,
};
pub use stores::Stores;
pub use surreal_store::SurrealStore;

/// Result type for aclctl-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
