//! Structured observability hooks for jobs, pipelines and deploys.
//!
//! - Job- and deploy-scoped spans (attach with `tracing::Instrument`)
//! - Emission functions for lifecycle events
//!
//! Everything is `info!` except the rollback-failure alert, which is
//! `error!`: a device may be left half-configured and needs an operator.

use tracing::{error, info, warn};

/// Span of one claimed job.
///
/// Returned un-entered: an entered guard is `!Send` and cannot be held
/// across `.await` in a spawned worker task.
pub fn job_span(job_id: &str, kind: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!("aclctl.job", job_id = %job_id, kind = %kind, attempt)
}

/// Span of one deploy attempt.
pub fn deploy_span(device_id: &str, revision_id: &str) -> tracing::Span {
    tracing::info_span!("aclctl.deploy", device_id = %device_id, revision_id = %revision_id)
}

pub fn emit_job_claimed(job_id: &str, kind: &str, worker: &str, attempt: u32) {
    info!(event = "job.claimed", job_id = %job_id, kind = %kind, worker = %worker, attempt);
}

pub fn emit_job_finished(job_id: &str, state: &str) {
    info!(event = "job.finished", job_id = %job_id, state = %state);
}

pub fn emit_pipeline_transition(pipeline_id: &str, from: &str, to: &str, seq: u64) {
    info!(
        event = "pipeline.transition",
        pipeline_id = %pipeline_id,
        from = %from,
        to = %to,
        seq,
    );
}

pub fn emit_gate_evaluated(fingerprint: &str, coverage: f64, min_coverage: f64, approved: bool) {
    info!(
        event = "gate.evaluated",
        fingerprint = %fingerprint,
        coverage,
        min_coverage,
        approved,
    );
}

pub fn emit_deploy_finished(device_id: &str, revision_id: &str, success: bool, duration_ms: u64) {
    info!(
        event = "deploy.finished",
        device_id = %device_id,
        revision_id = %revision_id,
        success,
        duration_ms,
    );
}

/// Transient failure; the job will be retried.
pub fn emit_retry_scheduled(job_id: &str, attempt: u32, delay_ms: u64, error: &dyn std::fmt::Display) {
    warn!(event = "job.retry", job_id = %job_id, attempt, delay_ms, error = %error);
}

/// Rollback after a failed apply did not succeed.
pub fn emit_rollback_failed(device_id: &str, revision_id: &str, error: &dyn std::fmt::Display) {
    error!(
        event = "deploy.rollback_failed",
        device_id = %device_id,
        revision_id = %revision_id,
        error = %error,
        "manual intervention required: device configuration may be inconsistent"
    );
}
