//! Deployment executor: apply one revision to one device.
//!
//! Flow: acquire the device lease, open a session, snapshot the running
//! configuration, apply, verify. A failure after the apply started restores
//! the snapshot and marks the revision `rolled_back`. The lease is released
//! on every exit path; if the worker dies instead, the lease expires.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aclctl_state::{
    DeviceLease, DeviceLeases, DeviceRecord, DeviceRegistry, RevisionRecord, RevisionStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};

use crate::domain::error::{AclError, Result};
use crate::ledger::RevisionLedger;
use crate::metrics::METRICS;
use crate::obs;
use crate::session::{DeviceSession, SessionFactory, TransportError};

/// Post-apply check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Verification {
    /// Every non-empty line of the applied configuration shows up in the
    /// running configuration read back after the apply.
    #[default]
    RunningConfigContains,
    /// Run `command`; its output must contain `must_contain` (if set) and
    /// must not match the `must_not_match` regex (if set).
    CheckCommand {
        command: String,
        #[serde(default)]
        must_contain: Option<String>,
        #[serde(default)]
        must_not_match: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Bound on each remote operation; expiry counts as unreachable.
    pub session_timeout: Duration,
    pub lease_ttl: chrono::Duration,
    pub verification: Verification,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            lease_ttl: chrono::Duration::seconds(600),
            verification: Verification::default(),
        }
    }
}

/// Asked before the first mutating operation of a deploy.
#[async_trait]
pub trait CancelSignal: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// A signal that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancelled;

#[async_trait]
impl CancelSignal for NeverCancelled {
    async fn is_cancelled(&self) -> bool {
        false
    }
}

/// Successful deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployReport {
    pub revision: RevisionRecord,
    pub device: DeviceRecord,
    /// Session steps and device output, in order
    pub transcript: Vec<String>,
    pub duration_ms: u64,
}

pub struct DeploymentExecutor {
    sessions: Arc<dyn SessionFactory>,
    leases: Arc<dyn DeviceLeases>,
    devices: Arc<dyn DeviceRegistry>,
    ledger: RevisionLedger,
    options: DeployOptions,
}

impl DeploymentExecutor {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        leases: Arc<dyn DeviceLeases>,
        devices: Arc<dyn DeviceRegistry>,
        ledger: RevisionLedger,
        options: DeployOptions,
    ) -> Self {
        Self {
            sessions,
            leases,
            devices,
            ledger,
            options,
        }
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    /// Apply `revision` to `device` as `holder`.
    ///
    /// Errors:
    /// - `DeviceBusy`: another holder has the device; nothing was touched.
    /// - `Unreachable`: the session could not be opened or the snapshot could
    ///   not be taken; nothing was touched.
    /// - `Cancelled`: cancellation was requested before the apply.
    /// - `DeploymentFailed`: apply or verification failed and the snapshot
    ///   was restored.
    /// - `RollbackFailed`: the snapshot could not be restored.
    pub async fn deploy(
        &self,
        device: &DeviceRecord,
        revision: &RevisionRecord,
        holder: &str,
        cancel: &dyn CancelSignal,
    ) -> Result<DeployReport> {
        if revision.status != RevisionStatus::Approved {
            return Err(AclError::IllegalTransition {
                from: revision.status.to_string(),
                event: "deploy".to_string(),
            });
        }
        if revision.device_id != device.device_id {
            return Err(AclError::InvalidPolicy(format!(
                "revision {} belongs to {}, not {}",
                revision.revision_id, revision.device_id, device.device_id
            )));
        }

        let mut lease = match self
            .leases
            .try_acquire(&device.device_id, holder, Utc::now(), self.options.lease_ttl)
            .await?
        {
            Some(lease) => lease,
            None => {
                let current = self.leases.holder(&device.device_id, Utc::now()).await?;
                return Err(AclError::DeviceBusy {
                    device_id: device.device_id.to_string(),
                    holder: current.map(|l| l.holder).unwrap_or_else(|| "unknown".into()),
                });
            }
        };

        let span = obs::deploy_span(device.device_id.as_str(), revision.revision_id.as_str());
        let started = Instant::now();
        let result = self
            .deploy_locked(device, revision, &mut lease, cancel)
            .instrument(span)
            .await;
        self.release(&lease).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_deploy_finished(
            device.device_id.as_str(),
            revision.revision_id.as_str(),
            result.is_ok(),
            duration_ms,
        );
        result.map(|(revision, device, transcript)| DeployReport {
            revision,
            device,
            transcript,
            duration_ms,
        })
    }

    async fn release(&self, lease: &DeviceLease) {
        if let Err(e) = self.leases.release(lease).await {
            // The lease expires on its own.
            warn!(device_id = %lease.device_id, error = %e, "failed to release device lease");
        }
    }

    /// Extend the hold before the next step. An expired or taken-over lease
    /// means another worker may own the device now.
    async fn renew(&self, lease: &mut DeviceLease) -> std::result::Result<(), String> {
        match self
            .leases
            .renew(lease, Utc::now(), self.options.lease_ttl)
            .await
        {
            Ok(renewed) => {
                *lease = renewed;
                Ok(())
            }
            Err(e) => {
                warn!(device_id = %lease.device_id, error = %e, "device lease lost");
                Err(format!("device lease lost: {e}"))
            }
        }
    }

    async fn deploy_locked(
        &self,
        device: &DeviceRecord,
        revision: &RevisionRecord,
        lease: &mut DeviceLease,
        cancel: &dyn CancelSignal,
    ) -> Result<(RevisionRecord, DeviceRecord, Vec<String>)> {
        let artifact = self.ledger.artifact_for(revision).await?;
        let mut transcript = Vec::new();
        let unreachable_err = |reason: String| AclError::Unreachable {
            device_id: device.device_id.to_string(),
            reason,
        };

        let mut session = self
            .bounded(self.sessions.open(device))
            .await
            .map_err(|e| unreachable_err(e.to_string()))?;
        transcript.push(format!("open {}", device.address));

        let snapshot = match self.bounded(session.get_running_config()).await {
            Ok(text) => text,
            Err(e) => {
                let _ = session.close().await;
                return Err(unreachable_err(format!("snapshot failed: {e}")));
            }
        };
        transcript.push(format!("snapshot {} bytes", snapshot.len()));

        if cancel.is_cancelled().await {
            let _ = session.close().await;
            return Err(AclError::Cancelled(format!(
                "deploy of {} cancelled before apply",
                revision.revision_id
            )));
        }

        if let Err(reason) = self.renew(lease).await {
            let _ = session.close().await;
            return Err(unreachable_err(format!("{reason}; nothing applied")));
        }

        let applied = match self.bounded(session.apply_config(&artifact.config_text)).await {
            Ok(output) => {
                transcript.push(format!(
                    "apply {} ({} bytes)",
                    artifact.filter_name,
                    artifact.config_text.len()
                ));
                push_output(&mut transcript, &output);
                self.verify(session.as_mut(), &artifact.config_text, &mut transcript)
                    .await
            }
            Err(e) => Err(format!("apply failed: {e}")),
        };

        let applied = match applied {
            Ok(()) => self.renew(lease).await.map_err(LeaseOutcome::Lost),
            Err(reason) => Err(LeaseOutcome::Failed(reason)),
        };

        match applied {
            Ok(()) => {
                let _ = session.close().await;
                let deployed = self.ledger.mark_deployed(&revision.revision_id).await?;
                let device = self
                    .devices
                    .set_current_revision(&device.device_id, &deployed)
                    .await?;
                transcript.push(format!("deployed {}", deployed.revision_id));
                METRICS.inc_deploys_succeeded();
                info!(seq = deployed.seq, "revision deployed");
                Ok((deployed, device, transcript))
            }
            Err(LeaseOutcome::Lost(reason)) => {
                // The device may already belong to another worker: leave it
                // and the current-revision pointer alone.
                let _ = session.close().await;
                transcript.push(reason.clone());
                self.ledger.mark_rolled_back(&revision.revision_id).await?;
                METRICS.inc_deploys_rolled_back();
                warn!(reason = %reason, "applied revision withdrawn");
                Err(AclError::DeploymentFailed {
                    device_id: device.device_id.to_string(),
                    reason,
                    transcript,
                })
            }
            Err(LeaseOutcome::Failed(reason)) => {
                transcript.push(reason.clone());
                self.roll_back(device, revision, lease, session, &snapshot, reason, transcript)
                    .await
            }
        }
    }

    async fn verify(
        &self,
        session: &mut dyn DeviceSession,
        config: &str,
        transcript: &mut Vec<String>,
    ) -> std::result::Result<(), String> {
        match &self.options.verification {
            Verification::RunningConfigContains => {
                let running = self
                    .bounded(session.get_running_config())
                    .await
                    .map_err(|e| format!("verification read-back failed: {e}"))?;
                let present: std::collections::HashSet<&str> =
                    running.lines().map(str::trim).collect();
                let missing: Vec<&str> = config
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !present.contains(l))
                    .collect();
                if missing.is_empty() {
                    transcript.push("verify: running configuration matches".to_string());
                    Ok(())
                } else {
                    Err(format!(
                        "verification failed: {} line(s) missing from running configuration, first: {}",
                        missing.len(),
                        missing[0]
                    ))
                }
            }
            Verification::CheckCommand {
                command,
                must_contain,
                must_not_match,
            } => {
                let output = self
                    .bounded(session.run_check(command))
                    .await
                    .map_err(|e| format!("verification command failed: {e}"))?;
                transcript.push(format!("check `{command}`"));
                push_output(transcript, &output);
                if let Some(needle) = must_contain {
                    if !output.contains(needle.as_str()) {
                        return Err(format!("verification failed: output lacks '{needle}'"));
                    }
                }
                if let Some(pattern) = must_not_match {
                    let re = Regex::new(pattern)
                        .map_err(|e| format!("invalid must_not_match pattern: {e}"))?;
                    if let Some(m) = re.find(&output) {
                        return Err(format!("verification failed: output matched '{}'", m.as_str()));
                    }
                }
                Ok(())
            }
        }
    }

    /// Restore `snapshot` and withdraw the revision.
    #[allow(clippy::too_many_arguments)]
    async fn roll_back(
        &self,
        device: &DeviceRecord,
        revision: &RevisionRecord,
        lease: &mut DeviceLease,
        mut session: Box<dyn DeviceSession>,
        snapshot: &str,
        reason: String,
        mut transcript: Vec<String>,
    ) -> Result<(RevisionRecord, DeviceRecord, Vec<String>)> {
        let restored = match self.renew(lease).await {
            Ok(()) => self
                .restore(device, lease, &mut session, snapshot, &mut transcript)
                .await
                .map_err(|e| e.to_string()),
            Err(lost) => Err(lost),
        };
        let _ = session.close().await;

        // Either way the revision is withdrawn; it was never verified.
        self.ledger.mark_rolled_back(&revision.revision_id).await?;
        METRICS.inc_deploys_rolled_back();

        match restored {
            Ok(output) => {
                transcript.push("rollback: snapshot restored".to_string());
                push_output(&mut transcript, &output);
                warn!(reason = %reason, "deploy rolled back");
                Err(AclError::DeploymentFailed {
                    device_id: device.device_id.to_string(),
                    reason,
                    transcript,
                })
            }
            Err(e) => {
                transcript.push(format!("rollback failed: {e}"));
                obs::emit_rollback_failed(
                    device.device_id.as_str(),
                    revision.revision_id.as_str(),
                    &e,
                );
                Err(AclError::RollbackFailed {
                    device_id: device.device_id.to_string(),
                    reason: format!("{reason}; rollback: {e}"),
                    transcript,
                })
            }
        }
    }

    /// Reapply `snapshot`, reconnecting once if the session broke.
    async fn restore(
        &self,
        device: &DeviceRecord,
        lease: &mut DeviceLease,
        session: &mut Box<dyn DeviceSession>,
        snapshot: &str,
        transcript: &mut Vec<String>,
    ) -> std::result::Result<String, TransportError> {
        let first = self.bounded(session.apply_config(snapshot)).await;
        match first {
            Err(e) if e.is_connectivity() => {
                if let Err(lost) = self.renew(lease).await {
                    return Err(TransportError::Unreachable(lost));
                }
                let _ = session.close().await;
                transcript.push("rollback: reconnecting".to_string());
                *session = self.bounded(self.sessions.open(device)).await?;
                self.bounded(session.apply_config(snapshot)).await
            }
            other => other,
        }
    }

    async fn bounded<T, F>(&self, op: F) -> std::result::Result<T, TransportError>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        tokio::time::timeout(self.options.session_timeout, op)
            .await
            .unwrap_or(Err(TransportError::Timeout(self.options.session_timeout)))
    }
}

impl std::fmt::Debug for DeploymentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentExecutor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Why a deploy did not get to record its revision.
enum LeaseOutcome {
    /// Apply or verification failed; the snapshot must be restored.
    Failed(String),
    /// Verified, but the lease was gone before the result could be recorded.
    Lost(String),
}

fn push_output(transcript: &mut Vec<String>, output: &str) {
    transcript.extend(
        output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| format!("  {l}")),
    );
}
