//! Bundle of trait objects handed to the core

use std::sync::Arc;

use crate::fakes::*;
use crate::storage_traits::*;

/// Every storage seam the pipeline needs, as shared trait objects.
#[derive(Clone)]
pub struct Stores {
    pub artifacts: Arc<dyn ArtifactCache>,
    pub policies: Arc<dyn PolicyStore>,
    pub devices: Arc<dyn DeviceRegistry>,
    pub revisions: Arc<dyn RevisionStore>,
    pub jobs: Arc<dyn JobQueue>,
    pub leases: Arc<dyn DeviceLeases>,
    pub pipelines: Arc<dyn PipelineLedger>,
}

impl Stores {
    /// Fresh in-memory fakes.
    pub fn in_memory() -> Self {
        Self {
            artifacts: Arc::new(MemoryArtifactCache::new()),
            policies: Arc::new(MemoryPolicyStore::new()),
            devices: Arc::new(MemoryDeviceRegistry::new()),
            revisions: Arc::new(MemoryRevisionStore::new()),
            jobs: Arc::new(MemoryJobQueue::new()),
            leases: Arc::new(MemoryDeviceLeases::new()),
            pipelines: Arc::new(MemoryPipelineLedger::new()),
        }
    }

    /// All seams served by one backend (e.g. `SurrealStore`).
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ArtifactCache
            + PolicyStore
            + DeviceRegistry
            + RevisionStore
            + JobQueue
            + DeviceLeases
            + PipelineLedger
            + 'static,
    {
        Self {
            artifacts: backend.clone(),
            policies: backend.clone(),
            devices: backend.clone(),
            revisions: backend.clone(),
            jobs: backend.clone(),
            leases: backend.clone(),
            pipelines: backend,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
