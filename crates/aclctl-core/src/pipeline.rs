//! Per-(policy, device) pipeline state machine.
//!
//! ```text
//! Submitted → Building → Gating → Rejected
//!                               ↘ Approved → Deploying → Deployed
//!                                                      ↘ Failed
//! ```
//!
//! Each state has one transition function; any event a state does not
//! accept is an [`AclError::IllegalTransition`]. `Approved` can only be
//! reached from `Gating` (gate passed) or, for rollbacks, from `Submitted`
//! with a previously deployed artifact, and `Deploying` only from `Approved`.

use aclctl_state::{JobId, PolicyFingerprint, RevisionId};
use serde::{Deserialize, Serialize};

use crate::domain::error::{AclError, Result};

/// Why a pipeline ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineFailure {
    /// Compiler rejected the policy; diagnostics verbatim.
    Compilation { diagnostics: String },
    /// Device stayed unreachable through every attempt.
    Unreachable { reason: String, attempts: u32 },
    /// Applied, failed verification, rolled back.
    Verification { revision_id: RevisionId, reason: String },
    /// Rollback itself failed; the device needs an operator.
    RollbackFailed { revision_id: RevisionId, reason: String },
    Cancelled { reason: String },
    /// Anything else that stopped the pipeline (bad input, exhausted retries).
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Submitted,
    Building {
        job_id: JobId,
    },
    Gating {
        fingerprint: PolicyFingerprint,
        coverage: f64,
    },
    Rejected {
        fingerprint: PolicyFingerprint,
        reason: String,
    },
    Approved {
        fingerprint: PolicyFingerprint,
        revision_id: RevisionId,
    },
    Deploying {
        revision_id: RevisionId,
        job_id: JobId,
        attempt: u32,
    },
    Deployed {
        revision_id: RevisionId,
    },
    Failed {
        failure: PipelineFailure,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    BuildStarted { job_id: JobId },
    Compiled { fingerprint: PolicyFingerprint, coverage: f64 },
    CompileFailed { diagnostics: String },
    GateRejected { reason: String },
    GateApproved { revision_id: RevisionId },
    /// Rollback: a previously deployed artifact re-enters as approved.
    Reapproved { fingerprint: PolicyFingerprint, revision_id: RevisionId },
    DeployEnqueued { job_id: JobId },
    DeployRetry { attempt: u32 },
    DeploySucceeded,
    DeployFailed { failure: PipelineFailure },
    Cancelled { reason: String },
    Aborted { reason: String },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::BuildStarted { .. } => "build_started",
            PipelineEvent::Compiled { .. } => "compiled",
            PipelineEvent::CompileFailed { .. } => "compile_failed",
            PipelineEvent::GateRejected { .. } => "gate_rejected",
            PipelineEvent::GateApproved { .. } => "gate_approved",
            PipelineEvent::Reapproved { .. } => "reapproved",
            PipelineEvent::DeployEnqueued { .. } => "deploy_enqueued",
            PipelineEvent::DeployRetry { .. } => "deploy_retry",
            PipelineEvent::DeploySucceeded => "deploy_succeeded",
            PipelineEvent::DeployFailed { .. } => "deploy_failed",
            PipelineEvent::Cancelled { .. } => "cancelled",
            PipelineEvent::Aborted { .. } => "aborted",
        }
    }
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Submitted => "submitted",
            PipelineState::Building { .. } => "building",
            PipelineState::Gating { .. } => "gating",
            PipelineState::Rejected { .. } => "rejected",
            PipelineState::Approved { .. } => "approved",
            PipelineState::Deploying { .. } => "deploying",
            PipelineState::Deployed { .. } => "deployed",
            PipelineState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Rejected { .. }
                | PipelineState::Deployed { .. }
                | PipelineState::Failed { .. }
        )
    }

    /// `Gating` is settled by the gate alone; an operator cannot cancel it,
    /// only abort it.
    pub fn accepts_cancel(&self) -> bool {
        !self.is_terminal() && !matches!(self, PipelineState::Gating { .. })
    }

    pub fn revision_id(&self) -> Option<&RevisionId> {
        match self {
            PipelineState::Approved { revision_id, .. }
            | PipelineState::Deploying { revision_id, .. }
            | PipelineState::Deployed { revision_id } => Some(revision_id),
            PipelineState::Failed {
                failure:
                    PipelineFailure::Verification { revision_id, .. }
                    | PipelineFailure::RollbackFailed { revision_id, .. },
            } => Some(revision_id),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// The state after `event`.
    pub fn apply(self, event: PipelineEvent) -> Result<PipelineState> {
        let from = self.name();
        let name = event.name();
        let next = match self {
            PipelineState::Submitted => on_submitted(event),
            PipelineState::Building { .. } => on_building(event),
            PipelineState::Gating { fingerprint, .. } => on_gating(fingerprint, event),
            PipelineState::Approved { revision_id, .. } => on_approved(revision_id, event),
            PipelineState::Deploying {
                revision_id,
                job_id,
                attempt,
            } => on_deploying(revision_id, job_id, attempt, event),
            PipelineState::Rejected { .. }
            | PipelineState::Deployed { .. }
            | PipelineState::Failed { .. } => None,
        };
        next.ok_or_else(|| AclError::IllegalTransition {
            from: from.to_string(),
            event: name.to_string(),
        })
    }
}

fn stopped(event: PipelineEvent) -> Option<PipelineState> {
    let failure = match event {
        PipelineEvent::Cancelled { reason } => PipelineFailure::Cancelled { reason },
        PipelineEvent::Aborted { reason } => PipelineFailure::Invalid { reason },
        _ => return None,
    };
    Some(PipelineState::Failed { failure })
}

fn on_submitted(event: PipelineEvent) -> Option<PipelineState> {
    match event {
        PipelineEvent::BuildStarted { job_id } => Some(PipelineState::Building { job_id }),
        PipelineEvent::Reapproved {
            fingerprint,
            revision_id,
        } => Some(PipelineState::Approved {
            fingerprint,
            revision_id,
        }),
        other => stopped(other),
    }
}

fn on_building(event: PipelineEvent) -> Option<PipelineState> {
    match event {
        PipelineEvent::Compiled {
            fingerprint,
            coverage,
        } => Some(PipelineState::Gating {
            fingerprint,
            coverage,
        }),
        PipelineEvent::CompileFailed { diagnostics } => Some(PipelineState::Failed {
            failure: PipelineFailure::Compilation { diagnostics },
        }),
        other => stopped(other),
    }
}

fn on_gating(fingerprint: PolicyFingerprint, event: PipelineEvent) -> Option<PipelineState> {
    match event {
        PipelineEvent::GateRejected { reason } => Some(PipelineState::Rejected {
            fingerprint,
            reason,
        }),
        PipelineEvent::GateApproved { revision_id } => Some(PipelineState::Approved {
            fingerprint,
            revision_id,
        }),
        PipelineEvent::Aborted { .. } => stopped(event),
        _ => None,
    }
}

fn on_approved(revision_id: RevisionId, event: PipelineEvent) -> Option<PipelineState> {
    match event {
        PipelineEvent::DeployEnqueued { job_id } => Some(PipelineState::Deploying {
            revision_id,
            job_id,
            attempt: 1,
        }),
        other => stopped(other),
    }
}

fn on_deploying(
    revision_id: RevisionId,
    job_id: JobId,
    attempt: u32,
    event: PipelineEvent,
) -> Option<PipelineState> {
    match event {
        PipelineEvent::DeployRetry { attempt: next } if next > attempt => {
            Some(PipelineState::Deploying {
                revision_id,
                job_id,
                attempt: next,
            })
        }
        PipelineEvent::DeploySucceeded => Some(PipelineState::Deployed { revision_id }),
        PipelineEvent::DeployFailed { failure } => Some(PipelineState::Failed { failure }),
        other => stopped(other),
    }
}
