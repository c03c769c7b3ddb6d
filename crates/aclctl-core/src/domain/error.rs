//! Domain-level error taxonomy for aclctl.

use aclctl_state::StorageError;

/// aclctl domain errors.
///
/// The first group mirrors how the pipeline treats each failure:
/// `Compilation` and `CoverageRejected` need a policy change, `Conflict` is
/// retried by re-reading, `DeviceBusy` requeues the job, `Unreachable` is
/// retried with backoff, `DeploymentFailed` is reported without retry and
/// `RollbackFailed` needs an operator. `CompilerUnavailable` is about the
/// compiler, not the policy, and is retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("compilation failed for {policy}: {diagnostics}")]
    Compilation { policy: String, diagnostics: String },

    #[error("compiler unavailable: {0}")]
    CompilerUnavailable(String),

    #[error("coverage rejected: {0}")]
    CoverageRejected(String),

    #[error("ledger conflict: {0}")]
    Conflict(String),

    #[error("device {device_id} is busy (held by {holder})")]
    DeviceBusy { device_id: String, holder: String },

    #[error("device {device_id} unreachable: {reason}")]
    Unreachable { device_id: String, reason: String },

    #[error("deployment to {device_id} failed and was rolled back: {reason}")]
    DeploymentFailed {
        device_id: String,
        reason: String,
        transcript: Vec<String>,
    },

    #[error("rollback on {device_id} failed, device may be inconsistent: {reason}")]
    RollbackFailed {
        device_id: String,
        reason: String,
        transcript: Vec<String>,
    },

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("illegal pipeline transition from {from} on {event}")]
    IllegalTransition { from: String, event: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AclError {
    /// Ledger conflicts surface either directly or through the store.
    pub fn is_conflict(&self) -> bool {
        match self {
            AclError::Conflict(_) => true,
            AclError::Storage(e) => e.is_conflict(),
            _ => false,
        }
    }

    /// Session transcript carried by deploy failures.
    pub fn transcript(&self) -> &[String] {
        match self {
            AclError::DeploymentFailed { transcript, .. }
            | AclError::RollbackFailed { transcript, .. } => transcript,
            _ => &[],
        }
    }
}

/// Result type for aclctl domain operations.
pub type Result<T> = std::result::Result<T, AclError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_error_keeps_diagnostics_verbatim() {
        let err = AclError::Compilation {
            policy: "web@juniper".to_string(),
            diagnostics: "line 3: unknown token 'acept'".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("web@juniper"));
        assert!(msg.contains("line 3: unknown token 'acept'"));
    }

    #[test]
    fn test_conflict_detection_through_storage() {
        let err: AclError = StorageError::conflict("edge-1/web@juniper", "stale").into();
        assert!(err.is_conflict());
        assert!(AclError::Conflict("x".into()).is_conflict());
        assert!(!AclError::InvalidPolicy("x".into()).is_conflict());
    }

    #[test]
    fn test_transcript_accessor() {
        let err = AclError::DeploymentFailed {
            device_id: "edge-1".into(),
            reason: "check failed".into(),
            transcript: vec!["snapshot".into(), "apply".into()],
        };
        assert_eq!(err.transcript().len(), 2);
        assert!(AclError::Config("x".into()).transcript().is_empty());
    }
}
