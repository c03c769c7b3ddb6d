//! Worker pool pulling jobs from the durable queue.
//!
//! Each worker task claims one job at a time and runs it to completion.
//! Several pools (in separate processes) may share one queue: claims, device
//! leases and ledger appends are arbitrated by the store.

use std::sync::Arc;
use std::time::Duration;

use aclctl_state::JobQueue;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

use crate::config::WorkerConfig;
use crate::coordinator::Coordinator;
use crate::domain::error::{AclError, Result};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: chrono::Duration,
    /// Prefix for worker names recorded on claims and leases
    pub name: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            visibility_timeout: chrono::Duration::seconds(config.visibility_timeout_secs as i64),
            name: format!("worker-{}", &id[..8]),
        }
    }
}

/// When a worker task stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
    Shutdown,
    Idle,
}

pub struct WorkerPool {
    coordinator: Arc<Coordinator>,
    jobs: Arc<dyn JobQueue>,
    settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(coordinator: Arc<Coordinator>, settings: WorkerSettings) -> Self {
        let jobs = coordinator.stores().jobs.clone();
        Self {
            coordinator,
            jobs,
            settings,
        }
    }

    /// Run until `shutdown` flips to `true`. Jobs in flight are finished
    /// first.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            workers = self.settings.concurrency,
            name = %self.settings.name,
            "worker pool started"
        );
        self.spawn_all(Until::Shutdown, shutdown).await?;
        METRICS.flush();
        info!("worker pool stopped");
        Ok(())
    }

    /// Run until no job is queued or running.
    pub async fn run_until_idle(&self) -> Result<()> {
        let (_tx, rx) = watch::channel(false);
        self.spawn_all(Until::Idle, rx).await?;
        METRICS.flush();
        Ok(())
    }

    async fn spawn_all(&self, until: Until, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut set = JoinSet::new();
        for i in 0..self.settings.concurrency {
            let worker = Worker {
                name: format!("{}-{i}", self.settings.name),
                coordinator: Arc::clone(&self.coordinator),
                jobs: Arc::clone(&self.jobs),
                poll_interval: self.settings.poll_interval,
                visibility_timeout: self.settings.visibility_timeout,
            };
            let shutdown = shutdown.clone();
            set.spawn(async move { worker.run(until, shutdown).await });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = joined
                .map_err(|e| AclError::Config(format!("worker task join error: {e}")))
                .and_then(|r| r);
            if let Err(e) = result {
                error!(error = %e, "worker stopped with error");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Worker {
    name: String,
    coordinator: Arc<Coordinator>,
    jobs: Arc<dyn JobQueue>,
    poll_interval: Duration,
    visibility_timeout: chrono::Duration,
}

impl Worker {
    async fn run(self, until: Until, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let claimed = self
                .jobs
                .claim(&self.name, Utc::now(), self.visibility_timeout)
                .await?;

            match claimed {
                Some(job) => {
                    let span = obs::job_span(job.job_id.as_str(), job.kind.as_str(), job.attempts);
                    match self
                        .coordinator
                        .process_job(&job, &self.name)
                        .instrument(span)
                        .await
                    {
                        Ok(_) => {}
                        // Superseded claim: another worker owns the job now.
                        Err(e) if e.is_conflict() => debug!(error = %e, "claim lost"),
                        Err(e) => error!(job_id = %job.job_id, error = %e, "job outcome not recorded"),
                    }
                }
                None => {
                    if until == Until::Idle && self.jobs.outstanding().await? == 0 {
                        return Ok(());
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        changed = shutdown.changed() => {
                            // A dropped sender counts as shutdown.
                            if changed.is_err() && until == Until::Shutdown {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}
