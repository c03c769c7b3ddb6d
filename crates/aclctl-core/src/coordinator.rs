//! Pipeline coordinator.
//!
//! Submission creates one pipeline per target device plus a single `build`
//! job and returns immediately. Workers hand claimed jobs to
//! [`Coordinator::process_job`], which drives the pipelines through
//! [`PipelineState`] and reports the job outcome to the queue.
//!
//! Job handlers tolerate redelivery: a build only advances pipelines that
//! have not moved past `Approved`, and a deploy job only acts when its
//! pipeline is `Deploying` under that very job.

use std::collections::BTreeSet;
use std::sync::Arc;

use aclctl_state::{
    DeviceId, DeviceRecord, JobId, JobKind, JobOutcome, JobQueue, JobRecord, JobState, NewJob,
    PipelineId, PipelineRecord, PolicyIdentity, PolicyRecord, RevisionStatus, Stores,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::compiler::{CompilerAdapter, PolicyCompiler};
use crate::config::AclctlConfig;
use crate::deploy::{CancelSignal, DeployOptions, DeploymentExecutor};
use crate::domain::error::{AclError, Result};
use crate::domain::job::{BuildPayload, BuildTarget, DeployPayload};
use crate::domain::policy::Policy;
use crate::gate::{ApprovedArtifact, CoverageGate, GateDecision};
use crate::ledger::RevisionLedger;
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{PipelineEvent, PipelineFailure, PipelineState};
use crate::retry::RetryPolicy;
use crate::session::SessionFactory;

/// Transition retries when another actor advanced a pipeline concurrently.
const TRANSITION_RETRIES: u32 = 3;

/// Tunables the coordinator needs.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorSettings {
    pub gate: CoverageGate,
    pub retry: RetryPolicy,
    pub deploy: DeployOptions,
}

impl CoordinatorSettings {
    pub fn from_config(config: &AclctlConfig) -> Self {
        Self {
            gate: config.gate.to_gate(),
            retry: config.retry.clone(),
            deploy: config.deploy.to_options(),
        }
    }
}

/// One device's pipeline created by a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineHandle {
    pub device_id: DeviceId,
    pub pipeline_id: PipelineId,
}

/// Returned by `submit` and `rollback` before any work runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub job_id: JobId,
    pub policy: PolicyIdentity,
    pub pipelines: Vec<PipelineHandle>,
}

/// A pipeline record with its state decoded.
struct Tracked {
    record: PipelineRecord,
    state: PipelineState,
}

pub struct Coordinator {
    stores: Stores,
    compiler: CompilerAdapter,
    ledger: RevisionLedger,
    executor: DeploymentExecutor,
    gate: CoverageGate,
    retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(
        stores: Stores,
        compiler: Arc<dyn PolicyCompiler>,
        sessions: Arc<dyn SessionFactory>,
        settings: CoordinatorSettings,
    ) -> Self {
        let ledger = RevisionLedger::new(stores.revisions.clone(), stores.artifacts.clone());
        let executor = DeploymentExecutor::new(
            sessions,
            stores.leases.clone(),
            stores.devices.clone(),
            ledger.clone(),
            settings.deploy,
        );
        Self {
            compiler: CompilerAdapter::new(compiler, stores.artifacts.clone()),
            ledger,
            executor,
            gate: settings.gate,
            retry: settings.retry,
            stores,
        }
    }

    pub fn from_config(
        config: &AclctlConfig,
        stores: Stores,
        compiler: Arc<dyn PolicyCompiler>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        Self::new(
            stores,
            compiler,
            sessions,
            CoordinatorSettings::from_config(config),
        )
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn ledger(&self) -> &RevisionLedger {
        &self.ledger
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Store a new version of `policy` (no-op when unchanged).
    pub async fn put_policy(&self, policy: &Policy) -> Result<PolicyRecord> {
        policy.validate()?;
        let fingerprint = policy.fingerprint()?;
        let record = self
            .stores
            .policies
            .put(&policy.identity(), policy.document()?, fingerprint)
            .await?;
        info!(policy = %record.identity, version = record.version, "policy stored");
        Ok(record)
    }

    pub async fn register_device(&self, device: DeviceRecord) -> Result<DeviceRecord> {
        if device.address.trim().is_empty() {
            return Err(AclError::InvalidPolicy(format!(
                "device {} has no address",
                device.device_id
            )));
        }
        Ok(self.stores.devices.upsert(device).await?)
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Enqueue a build of the latest version of `policy` for `devices`.
    ///
    /// Each device gets an independent pipeline; a failure on one device
    /// does not affect the others.
    #[instrument(skip_all, fields(policy = %policy, devices = devices.len()))]
    pub async fn submit(&self, policy: &PolicyIdentity, devices: &[DeviceId]) -> Result<Submission> {
        let targets: BTreeSet<&DeviceId> = devices.iter().collect();
        if targets.is_empty() {
            return Err(AclError::InvalidPolicy(
                "submission needs at least one device".to_string(),
            ));
        }
        let stored = self.stores.policies.get(policy).await?;

        let mut records = Vec::with_capacity(targets.len());
        for device_id in targets {
            let device = self.stores.devices.get(device_id).await?;
            check_platform(&device, &stored.identity)?;
            records.push(device);
        }

        let now = Utc::now();
        let initial = PipelineState::Submitted.to_value()?;
        let mut handles = Vec::with_capacity(records.len());
        for device in &records {
            let pipeline = self
                .stores
                .pipelines
                .create(PipelineRecord::new(
                    policy.clone(),
                    device.device_id.clone(),
                    initial.clone(),
                    now,
                ))
                .await?;
            handles.push(PipelineHandle {
                device_id: device.device_id.clone(),
                pipeline_id: pipeline.pipeline_id,
            });
        }

        let payload = BuildPayload {
            policy: policy.clone(),
            targets: handles
                .iter()
                .map(|h| BuildTarget {
                    device_id: h.device_id.clone(),
                    pipeline_id: h.pipeline_id.clone(),
                })
                .collect(),
        };
        let job = self
            .stores
            .jobs
            .enqueue(
                NewJob {
                    kind: JobKind::Build,
                    payload: payload.to_value()?,
                    pipeline_ids: handles.iter().map(|h| h.pipeline_id.clone()).collect(),
                    max_attempts: self.retry.max_attempts,
                    ready_at: now,
                },
                now,
            )
            .await?;
        info!(job_id = %job.job_id, version = stored.version, "build submitted");

        Ok(Submission {
            job_id: job.job_id,
            policy: policy.clone(),
            pipelines: handles,
        })
    }

    /// Redeploy the most recent earlier deployed artifact of (device, policy)
    /// as a new revision.
    #[instrument(skip_all, fields(device_id = %device_id, policy = %policy))]
    pub async fn rollback(&self, device_id: &DeviceId, policy: &PolicyIdentity) -> Result<Submission> {
        let device = self.stores.devices.get(device_id).await?;
        check_platform(&device, policy)?;
        let target = self
            .ledger
            .rollback_target(device_id, policy)
            .await?
            .ok_or_else(|| {
                AclError::InvalidPolicy(format!(
                    "no earlier deployed revision of {policy} on {device_id}"
                ))
            })?;
        let approved = self.ledger.reapprove(&target).await?;

        let now = Utc::now();
        let record = self
            .stores
            .pipelines
            .create(PipelineRecord::new(
                policy.clone(),
                device_id.clone(),
                PipelineState::Submitted.to_value()?,
                now,
            ))
            .await?;
        let mut tracked = Tracked {
            state: PipelineState::Submitted,
            record,
        };
        let revision = self.ledger.commit(device_id, policy, &approved).await?;
        self.advance(
            &mut tracked,
            PipelineEvent::Reapproved {
                fingerprint: revision.fingerprint.clone(),
                revision_id: revision.revision_id.clone(),
            },
            Some(format!("rollback to seq {}", target.seq)),
        )
        .await?;
        let job_id = self.enqueue_deploy(&mut tracked).await?;
        info!(job_id = %job_id, from_seq = target.seq, "rollback submitted");

        Ok(Submission {
            job_id,
            policy: policy.clone(),
            pipelines: vec![PipelineHandle {
                device_id: device_id.clone(),
                pipeline_id: tracked.record.pipeline_id,
            }],
        })
    }

    /// Cancel a job. Queued jobs stop immediately and their pipelines fail
    /// as cancelled; a running job is flagged and stops before its next
    /// mutating remote operation.
    pub async fn cancel(&self, job_id: &JobId) -> Result<JobRecord> {
        let job = self.stores.jobs.cancel(job_id, Utc::now()).await?;
        if job.state == JobState::Cancelled {
            self.stop_pipelines(&job, PipelineEvent::Cancelled {
                reason: "cancelled before a worker picked it up".to_string(),
            })
            .await;
        }
        Ok(job)
    }

    pub async fn pipeline(&self, pipeline_id: &PipelineId) -> Result<(PipelineRecord, PipelineState)> {
        let record = self.stores.pipelines.get(pipeline_id).await?;
        let state = PipelineState::from_value(&record.state)?;
        Ok((record, state))
    }

    // -----------------------------------------------------------------------
    // Job execution
    // -----------------------------------------------------------------------

    /// Run a claimed job and report its outcome to the queue.
    ///
    /// Returns `Conflict` when the claim was superseded (the visibility
    /// timeout expired and another worker took the job over).
    pub async fn process_job(&self, job: &JobRecord, worker: &str) -> Result<JobRecord> {
        obs::emit_job_claimed(job.job_id.as_str(), job.kind.as_str(), worker, job.attempts);
        let outcome = match self.run_job(job, worker).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let delay = self.retry.delay(job.attempts);
                obs::emit_retry_scheduled(job.job_id.as_str(), job.attempts, delay.as_millis() as u64, &e);
                METRICS.inc_retries();
                JobOutcome::Retry {
                    error: e.to_string(),
                    ready_at: after(Utc::now(), delay),
                }
            }
        };

        if let JobOutcome::Retry { error, .. } = &outcome {
            if job.attempts >= job.max_attempts {
                self.stop_pipelines(job, PipelineEvent::Aborted {
                    reason: format!("gave up after {} attempts: {error}", job.attempts),
                })
                .await;
            }
        }

        match self.stores.jobs.finish(job, outcome, Utc::now()).await {
            Ok(finished) => {
                obs::emit_job_finished(finished.job_id.as_str(), finished.state.as_str());
                Ok(finished)
            }
            Err(e) if e.is_conflict() => {
                warn!(job_id = %job.job_id, "claim superseded, outcome dropped");
                Err(AclError::Conflict(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Decide the outcome of a claimed job. `Err` means a transient
    /// problem (storage, serialization) and leads to a retry.
    pub async fn run_job(&self, job: &JobRecord, worker: &str) -> Result<JobOutcome> {
        match job.kind {
            JobKind::Build => self.run_build(job).await,
            JobKind::Deploy => self.run_deploy(job, worker).await,
        }
    }

    async fn run_build(&self, job: &JobRecord) -> Result<JobOutcome> {
        let payload = match BuildPayload::from_value(&job.payload) {
            Ok(p) => p,
            Err(e) => return Ok(self.abort_job(job, format!("bad build payload: {e}")).await),
        };

        let mut active = Vec::new();
        for target in &payload.targets {
            let record = self.stores.pipelines.get(&target.pipeline_id).await?;
            let state = PipelineState::from_value(&record.state)?;
            if matches!(
                state,
                PipelineState::Submitted
                    | PipelineState::Building { .. }
                    | PipelineState::Gating { .. }
                    | PipelineState::Approved { .. }
            ) {
                active.push(Tracked { record, state });
            }
        }
        if active.is_empty() {
            debug!(job_id = %job.job_id, "build already handled");
            return Ok(JobOutcome::Succeeded {
                output: json!({ "note": "no pipeline left to build" }),
            });
        }

        if job.cancel_requested {
            for tracked in &mut active {
                self.try_advance(
                    tracked,
                    PipelineEvent::Cancelled {
                        reason: "cancelled by operator".to_string(),
                    },
                )
                .await;
            }
            return Ok(JobOutcome::Cancelled);
        }

        for tracked in active
            .iter_mut()
            .filter(|t| t.state == PipelineState::Submitted)
        {
            self.advance(
                tracked,
                PipelineEvent::BuildStarted {
                    job_id: job.job_id.clone(),
                },
                None,
            )
            .await?;
        }

        let stored = self.stores.policies.get(&payload.policy).await?;
        let needs_artifact = active.iter().any(|t| {
            matches!(
                t.state,
                PipelineState::Building { .. } | PipelineState::Gating { .. }
            )
        });

        let mut rejected = None;
        let mut output = json!({
            "policy": payload.policy.key(),
            "policy_version": stored.version,
        });

        if needs_artifact {
            let policy = match Policy::from_document(&stored.document) {
                Ok(p) => p,
                Err(e) => return Ok(self.abort_tracked(&mut active, e.to_string()).await),
            };
            let compiled = match self.compiler.compile(&policy).await {
                Ok(outcome) => outcome,
                Err(AclError::Compilation { diagnostics, .. }) => {
                    for tracked in active
                        .iter_mut()
                        .filter(|t| matches!(t.state, PipelineState::Building { .. }))
                    {
                        self.advance(
                            tracked,
                            PipelineEvent::CompileFailed {
                                diagnostics: diagnostics.clone(),
                            },
                            None,
                        )
                        .await?;
                    }
                    return Ok(JobOutcome::Failed {
                        error: format!("compilation failed: {diagnostics}"),
                        output,
                    });
                }
                Err(e @ AclError::InvalidPolicy(_)) => {
                    return Ok(self.abort_tracked(&mut active, e.to_string()).await)
                }
                Err(e) => return Err(e),
            };
            let artifact = &compiled.artifact;
            output["fingerprint"] = json!(artifact.fingerprint.as_str());
            output["coverage_score"] = json!(artifact.coverage_score);
            output["cached"] = json!(compiled.cached);

            for tracked in active
                .iter_mut()
                .filter(|t| matches!(t.state, PipelineState::Building { .. }))
            {
                self.advance(
                    tracked,
                    PipelineEvent::Compiled {
                        fingerprint: artifact.fingerprint.clone(),
                        coverage: artifact.coverage_score,
                    },
                    None,
                )
                .await?;
            }

            let decision = self.gate.evaluate(artifact);
            obs::emit_gate_evaluated(
                artifact.fingerprint.as_str(),
                artifact.coverage_score,
                self.gate.min_coverage,
                decision.is_approved(),
            );
            match decision {
                GateDecision::Approved(approved) => {
                    self.commit_approved(&mut active, &payload.policy, &approved)
                        .await?;
                }
                GateDecision::Rejected { reason, .. } => {
                    for tracked in active
                        .iter_mut()
                        .filter(|t| matches!(t.state, PipelineState::Gating { .. }))
                    {
                        self.advance(
                            tracked,
                            PipelineEvent::GateRejected {
                                reason: reason.clone(),
                            },
                            None,
                        )
                        .await?;
                    }
                    rejected = Some(reason);
                }
            }
        }

        let mut deploy_jobs = Vec::new();
        for tracked in active
            .iter_mut()
            .filter(|t| matches!(t.state, PipelineState::Approved { .. }))
        {
            deploy_jobs.push(self.enqueue_deploy(tracked).await?);
        }
        output["deploy_jobs"] = json!(deploy_jobs);

        Ok(match rejected {
            Some(reason) => JobOutcome::Failed {
                error: AclError::CoverageRejected(reason).to_string(),
                output,
            },
            None => JobOutcome::Succeeded { output },
        })
    }

    async fn commit_approved(
        &self,
        active: &mut [Tracked],
        policy: &PolicyIdentity,
        approved: &ApprovedArtifact,
    ) -> Result<()> {
        for tracked in active
            .iter_mut()
            .filter(|t| matches!(t.state, PipelineState::Gating { .. }))
        {
            let device_id = tracked.record.device_id.clone();
            let revision = self.ledger.commit(&device_id, policy, approved).await?;
            self.advance(
                tracked,
                PipelineEvent::GateApproved {
                    revision_id: revision.revision_id.clone(),
                },
                Some(format!("revision seq {}", revision.seq)),
            )
            .await?;
        }
        Ok(())
    }

    async fn enqueue_deploy(&self, tracked: &mut Tracked) -> Result<JobId> {
        let revision_id = match &tracked.state {
            PipelineState::Approved { revision_id, .. } => revision_id.clone(),
            other => {
                return Err(AclError::IllegalTransition {
                    from: other.name().to_string(),
                    event: "deploy_enqueued".to_string(),
                })
            }
        };
        let payload = DeployPayload {
            policy: tracked.record.policy.clone(),
            device_id: tracked.record.device_id.clone(),
            revision_id,
            pipeline_id: tracked.record.pipeline_id.clone(),
        };
        let now = Utc::now();
        let job = self
            .stores
            .jobs
            .enqueue(
                NewJob {
                    kind: JobKind::Deploy,
                    payload: payload.to_value()?,
                    pipeline_ids: vec![tracked.record.pipeline_id.clone()],
                    max_attempts: self.retry.max_attempts,
                    ready_at: now,
                },
                now,
            )
            .await?;
        self.advance(
            tracked,
            PipelineEvent::DeployEnqueued {
                job_id: job.job_id.clone(),
            },
            None,
        )
        .await?;
        Ok(job.job_id)
    }

    async fn run_deploy(&self, job: &JobRecord, worker: &str) -> Result<JobOutcome> {
        let payload = match DeployPayload::from_value(&job.payload) {
            Ok(p) => p,
            Err(e) => return Ok(self.abort_job(job, format!("bad deploy payload: {e}")).await),
        };
        let record = self.stores.pipelines.get(&payload.pipeline_id).await?;
        let state = PipelineState::from_value(&record.state)?;
        let attempt = match &state {
            PipelineState::Deploying {
                job_id, attempt, ..
            } if job_id == &job.job_id => *attempt,
            other => {
                debug!(state = other.name(), "deploy job no longer owns its pipeline");
                return Ok(JobOutcome::Succeeded {
                    output: json!({ "note": format!("pipeline is {}", other.name()) }),
                });
            }
        };
        let mut tracked = Tracked { record, state };

        if job.cancel_requested {
            self.try_advance(
                &mut tracked,
                PipelineEvent::Cancelled {
                    reason: "cancelled by operator".to_string(),
                },
            )
            .await;
            return Ok(JobOutcome::Cancelled);
        }

        let revision = self.ledger.get(&payload.revision_id).await?;
        match revision.status {
            RevisionStatus::Deployed => {
                // Applied on an earlier delivery whose outcome was lost.
                self.stores
                    .devices
                    .set_current_revision(&payload.device_id, &revision)
                    .await?;
                self.advance(&mut tracked, PipelineEvent::DeploySucceeded, None)
                    .await?;
                return Ok(JobOutcome::Succeeded {
                    output: json!({ "revision_id": revision.revision_id, "note": "already deployed" }),
                });
            }
            RevisionStatus::RolledBack => {
                let failure = PipelineFailure::Verification {
                    revision_id: revision.revision_id.clone(),
                    reason: "rolled back on an earlier attempt".to_string(),
                };
                self.advance(&mut tracked, PipelineEvent::DeployFailed { failure }, None)
                    .await?;
                return Ok(JobOutcome::Failed {
                    error: "revision was rolled back on an earlier attempt".to_string(),
                    output: serde_json::Value::Null,
                });
            }
            RevisionStatus::Pending | RevisionStatus::Approved => {}
        }

        let device = self.stores.devices.get(&payload.device_id).await?;
        let signal = JobCancelSignal {
            jobs: self.stores.jobs.clone(),
            job_id: job.job_id.clone(),
        };

        match self.executor.deploy(&device, &revision, worker, &signal).await {
            Ok(report) => {
                self.advance(&mut tracked, PipelineEvent::DeploySucceeded, None)
                    .await?;
                Ok(JobOutcome::Succeeded {
                    output: serde_json::to_value(&report)?,
                })
            }
            Err(AclError::DeviceBusy { holder, .. }) => {
                METRICS.inc_retries();
                debug!(holder = %holder, "device busy, requeueing");
                Ok(JobOutcome::Requeue {
                    ready_at: after(Utc::now(), self.retry.busy_delay()),
                })
            }
            Err(e @ AclError::Unreachable { .. }) => {
                let reason = e.to_string();
                if job.attempts >= job.max_attempts {
                    let failure = PipelineFailure::Unreachable {
                        reason: reason.clone(),
                        attempts: job.attempts,
                    };
                    self.advance(&mut tracked, PipelineEvent::DeployFailed { failure }, None)
                        .await?;
                } else {
                    self.advance(
                        &mut tracked,
                        PipelineEvent::DeployRetry {
                            attempt: attempt.max(job.attempts) + 1,
                        },
                        Some(reason.clone()),
                    )
                    .await?;
                }
                let delay = self.retry.delay(job.attempts);
                obs::emit_retry_scheduled(job.job_id.as_str(), job.attempts, delay.as_millis() as u64, &e);
                METRICS.inc_retries();
                Ok(JobOutcome::Retry {
                    error: reason,
                    ready_at: after(Utc::now(), delay),
                })
            }
            Err(AclError::DeploymentFailed {
                reason, transcript, ..
            }) => {
                let failure = PipelineFailure::Verification {
                    revision_id: revision.revision_id.clone(),
                    reason: reason.clone(),
                };
                self.advance(&mut tracked, PipelineEvent::DeployFailed { failure }, None)
                    .await?;
                Ok(JobOutcome::Failed {
                    error: format!("deployment failed and was rolled back: {reason}"),
                    output: json!({ "transcript": transcript }),
                })
            }
            Err(AclError::RollbackFailed {
                reason, transcript, ..
            }) => {
                let failure = PipelineFailure::RollbackFailed {
                    revision_id: revision.revision_id.clone(),
                    reason: reason.clone(),
                };
                self.advance(&mut tracked, PipelineEvent::DeployFailed { failure }, None)
                    .await?;
                Ok(JobOutcome::Failed {
                    error: format!("rollback failed, manual intervention required: {reason}"),
                    output: json!({ "transcript": transcript }),
                })
            }
            Err(AclError::Cancelled(reason)) => {
                self.try_advance(&mut tracked, PipelineEvent::Cancelled { reason })
                    .await;
                Ok(JobOutcome::Cancelled)
            }
            Err(e @ (AclError::IllegalTransition { .. } | AclError::InvalidPolicy(_))) => {
                Ok(self.abort_tracked(std::slice::from_mut(&mut tracked), e.to_string()).await)
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline transitions
    // -----------------------------------------------------------------------

    /// Apply `event` and persist it, re-reading once per concurrent writer.
    async fn advance(
        &self,
        tracked: &mut Tracked,
        event: PipelineEvent,
        note: Option<String>,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let from = tracked.state.name();
            let next = tracked.state.clone().apply(event.clone())?;
            match self
                .stores
                .pipelines
                .record_transition(
                    &tracked.record.pipeline_id,
                    tracked.record.seq(),
                    next.to_value()?,
                    note.clone(),
                    Utc::now(),
                )
                .await
            {
                Ok(record) => {
                    obs::emit_pipeline_transition(
                        record.pipeline_id.as_str(),
                        from,
                        next.name(),
                        record.seq(),
                    );
                    tracked.record = record;
                    tracked.state = next;
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < TRANSITION_RETRIES => {
                    let record = self.stores.pipelines.get(&tracked.record.pipeline_id).await?;
                    tracked.state = PipelineState::from_value(&record.state)?;
                    tracked.record = record;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Best-effort transition used on stop paths; terminal pipelines are
    /// left alone and a cancel that the state refuses becomes an abort.
    async fn try_advance(&self, tracked: &mut Tracked, event: PipelineEvent) {
        if tracked.state.is_terminal() {
            return;
        }
        let event = match event {
            PipelineEvent::Cancelled { reason } if !tracked.state.accepts_cancel() => {
                PipelineEvent::Aborted {
                    reason: format!("{reason} while {}", tracked.state.name()),
                }
            }
            other => other,
        };
        if let Err(e) = self.advance(tracked, event, None).await {
            warn!(pipeline_id = %tracked.record.pipeline_id, error = %e, "pipeline transition skipped");
        }
    }

    /// Stop the pipelines `job` is still driving. Pipelines a build already
    /// handed to their own deploy jobs are left to those jobs.
    async fn stop_pipelines(&self, job: &JobRecord, event: PipelineEvent) {
        for pipeline_id in &job.pipeline_ids {
            let tracked = match self.stores.pipelines.get(pipeline_id).await {
                Ok(record) => PipelineState::from_value(&record.state)
                    .map(|state| Tracked { record, state }),
                Err(e) => Err(e.into()),
            };
            match tracked {
                Ok(mut tracked) if drives(job, &tracked.state) => {
                    self.try_advance(&mut tracked, event.clone()).await
                }
                Ok(tracked) => debug!(
                    pipeline_id = %pipeline_id,
                    state = tracked.state.name(),
                    "pipeline moved on, not stopped"
                ),
                Err(e) => warn!(pipeline_id = %pipeline_id, error = %e, "pipeline not stopped"),
            }
        }
    }

    async fn abort_job(&self, job: &JobRecord, reason: String) -> JobOutcome {
        self.stop_pipelines(job, PipelineEvent::Aborted {
            reason: reason.clone(),
        })
        .await;
        JobOutcome::Failed {
            error: reason,
            output: serde_json::Value::Null,
        }
    }

    async fn abort_tracked(&self, active: &mut [Tracked], reason: String) -> JobOutcome {
        for tracked in active.iter_mut() {
            self.try_advance(
                tracked,
                PipelineEvent::Aborted {
                    reason: reason.clone(),
                },
            )
            .await;
        }
        JobOutcome::Failed {
            error: reason,
            output: serde_json::Value::Null,
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("gate", &self.gate)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Reads the job's cancel flag from the queue.
struct JobCancelSignal {
    jobs: Arc<dyn JobQueue>,
    job_id: JobId,
}

#[async_trait]
impl CancelSignal for JobCancelSignal {
    async fn is_cancelled(&self) -> bool {
        match self.jobs.get(&self.job_id).await {
            Ok(job) => job.cancel_requested,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "cannot read cancel flag");
                false
            }
        }
    }
}

/// Whether `job` is the job currently responsible for a pipeline in `state`.
fn drives(job: &JobRecord, state: &PipelineState) -> bool {
    match (job.kind, state) {
        (
            JobKind::Build,
            PipelineState::Submitted
            | PipelineState::Building { .. }
            | PipelineState::Gating { .. }
            | PipelineState::Approved { .. },
        ) => true,
        (JobKind::Deploy, PipelineState::Deploying { job_id, .. }) => job_id == &job.job_id,
        _ => false,
    }
}

fn check_platform(device: &DeviceRecord, policy: &PolicyIdentity) -> Result<()> {
    if !device.platform.eq_ignore_ascii_case(&policy.platform) {
        return Err(AclError::InvalidPolicy(format!(
            "device {} runs {}, policy {} targets {}",
            device.device_id, device.platform, policy.name, policy.platform
        )));
    }
    Ok(())
}

fn after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}
