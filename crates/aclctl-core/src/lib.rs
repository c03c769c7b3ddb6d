//! aclctl Core Library
//!
//! Compile ACL policies into vendor configuration, gate them on coverage,
//! record approved revisions per device, and deploy them with snapshot and
//! automatic rollback. A durable job queue and per-pipeline state machine
//! tie the stages together.

pub mod compiler;
pub mod config;
pub mod coordinator;
pub mod coverage;
pub mod deploy;
pub mod diff;
pub mod domain;
pub mod gate;
pub mod ledger;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod retry;
pub mod session;
pub mod telemetry;
pub mod testing;
pub mod worker;

pub use domain::{
    AclError, Action, BuildPayload, BuildTarget, DeployPayload, Policy, Result, Term, TermOption,
    TestCase,
};

pub use compiler::external::ExternalCompiler;
pub use compiler::{CompileOutcome, CompilerAdapter, CompilerFailure, PolicyCompiler, Rendered};

pub use coverage::Coverage;
pub use gate::{ApprovedArtifact, CoverageGate, GateDecision, GateRule, GateVerdict, Violation};

pub use diff::{ConfigDiff, LineChange};
pub use ledger::RevisionLedger;

pub use session::ssh::{SshCommandSessionFactory, SshSettings};
pub use session::{
    CredentialStore, Credentials, DeviceSession, EnvCredentialStore, SessionFactory,
    TransportError,
};

pub use deploy::{
    CancelSignal, DeployOptions, DeployReport, DeploymentExecutor, NeverCancelled, Verification,
};
pub use retry::RetryPolicy;

pub use pipeline::{PipelineEvent, PipelineFailure, PipelineState};

pub use config::AclctlConfig;
pub use coordinator::{Coordinator, CoordinatorSettings, PipelineHandle, Submission};
pub use worker::{WorkerPool, WorkerSettings};

pub use telemetry::init_tracing;

pub use aclctl_state::{
    DeviceId, DeviceRecord, JobId, JobKind, JobRecord, JobState, PipelineId, PolicyIdentity,
    RevisionId, RevisionRecord, RevisionStatus, Stores,
};

/// aclctl version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
