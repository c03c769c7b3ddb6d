//! aclctl - ACL policy pipeline CLI
//!
//! The `aclctl` command drives policies from source to devices.
//!
//! ## Commands
//!
//! - `device`: register and list managed devices
//! - `policy`: store and inspect policy documents
//! - `submit`: compile, gate and deploy a policy to devices
//! - `job` / `pipeline`: inspect and cancel queued work
//! - `revision`: ledger history and configuration diffs
//! - `rollback`: redeploy the previously deployed artifact
//! - `work`: run a worker pool in the foreground
//! - `config`: print the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, Level};

use aclctl_core::config::AclctlConfig;
use aclctl_core::coordinator::{Coordinator, Submission};
use aclctl_core::pipeline::PipelineState;
use aclctl_core::worker::{WorkerPool, WorkerSettings};
use aclctl_core::{EnvCredentialStore, Policy, SshCommandSessionFactory};
use aclctl_state::{
    DeviceId, DeviceRecord, JobId, JobState, PipelineId, PolicyIdentity, RevisionId, Stores,
    SurrealStore,
};

#[derive(Parser)]
#[command(name = "aclctl")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile, gate, record and deploy ACL policies", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: ./aclctl.toml)
    #[arg(short, long, global = true, env = "ACLCTL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage devices
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },

    /// Manage policy documents
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Build the latest version of a policy and deploy it to devices
    Submit {
        /// Policy name
        policy: String,

        /// Target platform of the policy
        #[arg(short, long)]
        platform: String,

        /// Target device (repeatable)
        #[arg(short, long = "device", required = true)]
        devices: Vec<String>,

        /// Process the queue in-process until the pipelines finish
        #[arg(long)]
        wait: bool,
    },

    /// Inspect or cancel jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Inspect pipelines
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },

    /// Revision ledger operations
    Revision {
        #[command(subcommand)]
        action: RevisionAction,
    },

    /// Redeploy the previously deployed artifact of a policy on a device
    Rollback {
        /// Device ID
        device: String,

        /// Policy name
        #[arg(long)]
        policy: String,

        /// Target platform of the policy
        #[arg(short, long)]
        platform: String,

        /// Process the queue in-process until the pipeline finishes
        #[arg(long)]
        wait: bool,
    },

    /// Run a worker pool in the foreground
    Work {
        /// Exit once no job is queued or running
        #[arg(long)]
        until_idle: bool,

        /// Override worker.concurrency
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum DeviceAction {
    /// Register or update a device
    Add {
        /// Device ID
        id: String,

        /// Management address
        #[arg(long)]
        address: String,

        /// Platform (e.g. juniper, cisco, arista)
        #[arg(short, long)]
        platform: String,

        /// Credential reference resolved from ACLCTL_CRED_<REF>_*
        #[arg(long)]
        credential: String,

        /// SSH port
        #[arg(long)]
        port: Option<u16>,
    },

    /// List devices
    List,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Store a policy from a JSON or TOML file
    Put {
        /// Policy file
        file: PathBuf,
    },

    /// List the latest version of every policy
    List,

    /// Print a stored policy document
    Show {
        /// Policy name
        name: String,

        /// Target platform
        #[arg(short, long)]
        platform: String,

        /// Version (default: latest)
        #[arg(long)]
        version: Option<u64>,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Show one job
    Show {
        /// Job ID
        id: String,
    },

    /// List jobs
    List {
        /// Only jobs in this state (queued, running, succeeded, failed, dead, cancelled)
        #[arg(long)]
        state: Option<String>,
    },

    /// Cancel a job
    Cancel {
        /// Job ID
        id: String,
    },
}

#[derive(Subcommand)]
enum PipelineAction {
    /// Show a pipeline and its transitions
    Show {
        /// Pipeline ID
        id: String,
    },

    /// List pipelines
    List {
        /// Only pipelines for this device
        #[arg(long)]
        device: Option<String>,
    },
}

#[derive(Subcommand)]
enum RevisionAction {
    /// Revision history of a policy on a device (newest first)
    History {
        /// Device ID
        device: String,

        /// Policy name
        #[arg(long)]
        policy: String,

        /// Target platform
        #[arg(short, long)]
        platform: String,
    },

    /// Line diff between the configurations of two revisions
    Diff {
        /// Older revision ID
        from: String,
        /// Newer revision ID
        to: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    aclctl_core::init_tracing(cli.json, level);

    let config = AclctlConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Commands::Config = cli.command {
        return cmd_config(&config);
    }

    let store = SurrealStore::from_env()
        .await
        .context("Failed to connect to aclctl database")?;
    let coordinator = Arc::new(build_coordinator(&config, Stores::from_backend(Arc::new(store))));
    let workers = WorkerSettings::from_config(&config.worker);

    match cli.command {
        Commands::Device { action } => match action {
            DeviceAction::Add {
                id,
                address,
                platform,
                credential,
                port,
            } => {
                let device = DeviceRecord {
                    device_id: DeviceId::from(id.as_str()),
                    address,
                    port,
                    credential_ref: credential,
                    platform,
                    current_revision: None,
                };
                cmd_device_add(&coordinator, device).await
            }
            DeviceAction::List => cmd_device_list(&coordinator).await,
        },
        Commands::Policy { action } => match action {
            PolicyAction::Put { file } => cmd_policy_put(&coordinator, &file).await,
            PolicyAction::List => cmd_policy_list(&coordinator).await,
            PolicyAction::Show {
                name,
                platform,
                version,
            } => cmd_policy_show(&coordinator, &PolicyIdentity::new(name, platform), version).await,
        },
        Commands::Submit {
            policy,
            platform,
            devices,
            wait,
        } => {
            let identity = PolicyIdentity::new(policy, platform);
            let submission = cmd_submit(&coordinator, &identity, &devices).await?;
            if wait {
                run_until_idle(&coordinator, workers).await?;
                print_outcome(&coordinator, &submission).await?;
            }
            Ok(())
        }
        Commands::Job { action } => match action {
            JobAction::Show { id } => cmd_job_show(&coordinator, &id).await,
            JobAction::List { state } => cmd_job_list(&coordinator, state.as_deref()).await,
            JobAction::Cancel { id } => cmd_job_cancel(&coordinator, &id).await,
        },
        Commands::Pipeline { action } => match action {
            PipelineAction::Show { id } => cmd_pipeline_show(&coordinator, &id).await,
            PipelineAction::List { device } => {
                cmd_pipeline_list(&coordinator, device.as_deref()).await
            }
        },
        Commands::Revision { action } => match action {
            RevisionAction::History {
                device,
                policy,
                platform,
            } => {
                cmd_revision_history(&coordinator, &device, &PolicyIdentity::new(policy, platform))
                    .await
            }
            RevisionAction::Diff { from, to } => cmd_revision_diff(&coordinator, &from, &to).await,
        },
        Commands::Rollback {
            device,
            policy,
            platform,
            wait,
        } => {
            let identity = PolicyIdentity::new(policy, platform);
            let submission = cmd_rollback(&coordinator, &device, &identity).await?;
            if wait {
                run_until_idle(&coordinator, workers).await?;
                print_outcome(&coordinator, &submission).await?;
            }
            Ok(())
        }
        Commands::Work {
            until_idle,
            workers: count,
        } => {
            let mut settings = workers;
            if let Some(n) = count {
                settings.concurrency = n.max(1);
            }
            cmd_work(coordinator, settings, until_idle).await
        }
        Commands::Config => unreachable!("handled before connecting"),
    }
}

fn build_coordinator(config: &AclctlConfig, stores: Stores) -> Coordinator {
    let compiler = Arc::new(config.compiler.to_compiler());
    let sessions = Arc::new(SshCommandSessionFactory::new(
        config.session.to_settings(),
        Arc::new(EnvCredentialStore::from_env()),
    ));
    Coordinator::from_config(config, stores, compiler, sessions)
}

// ========== Devices ==========

async fn cmd_device_add(coordinator: &Coordinator, device: DeviceRecord) -> Result<()> {
    let device = coordinator
        .register_device(device)
        .await
        .context("failed to register device")?;
    println!(
        "Registered {} ({}, {})",
        device.device_id, device.platform, device.address
    );
    Ok(())
}

async fn cmd_device_list(coordinator: &Coordinator) -> Result<()> {
    let devices = coordinator.stores().devices.list().await?;
    if devices.is_empty() {
        println!("No devices registered");
        return Ok(());
    }
    for device in devices {
        println!(
            "{:<20} {:<10} {:<30} {}",
            device.device_id.as_str(),
            device.platform,
            device.address,
            device
                .current_revision
                .as_ref()
                .map(|r| r.as_str())
                .unwrap_or("-")
        );
    }
    Ok(())
}

// ========== Policies ==========

fn read_policy(path: &Path) -> Result<Policy> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let policy = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        _ => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?,
    };
    Ok(policy)
}

async fn cmd_policy_put(coordinator: &Coordinator, path: &Path) -> Result<()> {
    let policy = read_policy(path)?;
    let record = coordinator.put_policy(&policy).await?;
    println!(
        "Stored {} version {} ({})",
        record.identity,
        record.version,
        record.fingerprint.short()
    );
    Ok(())
}

async fn cmd_policy_list(coordinator: &Coordinator) -> Result<()> {
    let policies = coordinator.stores().policies.list().await?;
    if policies.is_empty() {
        println!("No policies stored");
        return Ok(());
    }
    for record in policies {
        println!(
            "{:<30} v{:<4} {} {}",
            record.identity.to_string(),
            record.version,
            record.fingerprint.short(),
            record.updated_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_policy_show(
    coordinator: &Coordinator,
    identity: &PolicyIdentity,
    version: Option<u64>,
) -> Result<()> {
    let policies = &coordinator.stores().policies;
    let record = match version {
        Some(v) => policies.get_version(identity, v).await?,
        None => policies.get(identity).await?,
    };
    println!("{}", serde_json::to_string_pretty(&record.document)?);
    Ok(())
}

// ========== Submission ==========

async fn cmd_submit(
    coordinator: &Coordinator,
    policy: &PolicyIdentity,
    devices: &[String],
) -> Result<Submission> {
    let devices: Vec<DeviceId> = devices.iter().map(|d| DeviceId::from(d.as_str())).collect();
    let submission = coordinator.submit(policy, &devices).await?;
    println!("Submitted build job {}", submission.job_id);
    for handle in &submission.pipelines {
        println!("  {} -> pipeline {}", handle.device_id, handle.pipeline_id);
    }
    Ok(submission)
}

async fn cmd_rollback(
    coordinator: &Coordinator,
    device: &str,
    policy: &PolicyIdentity,
) -> Result<Submission> {
    let submission = coordinator
        .rollback(&DeviceId::from(device), policy)
        .await?;
    println!("Submitted rollback deploy job {}", submission.job_id);
    for handle in &submission.pipelines {
        println!("  {} -> pipeline {}", handle.device_id, handle.pipeline_id);
    }
    Ok(submission)
}

async fn print_outcome(coordinator: &Coordinator, submission: &Submission) -> Result<()> {
    let mut failed = 0;
    for handle in &submission.pipelines {
        let (_, state) = coordinator.pipeline(&handle.pipeline_id).await?;
        if !matches!(state, PipelineState::Deployed { .. }) {
            failed += 1;
        }
        println!("{:<20} {}", handle.device_id.as_str(), describe(&state));
    }
    if failed > 0 {
        bail!("{failed} of {} pipeline(s) did not deploy", submission.pipelines.len());
    }
    Ok(())
}

fn describe(state: &PipelineState) -> String {
    match state {
        PipelineState::Rejected { reason, .. } => format!("rejected: {reason}"),
        PipelineState::Deployed { revision_id } => format!("deployed {revision_id}"),
        PipelineState::Failed { failure } => match serde_json::to_value(failure) {
            Ok(v) => format!("failed: {v}"),
            Err(_) => "failed".to_string(),
        },
        other => other.name().to_string(),
    }
}

// ========== Jobs and pipelines ==========

async fn cmd_job_show(coordinator: &Coordinator, id: &str) -> Result<()> {
    let job = coordinator.stores().jobs.get(&JobId::from(id)).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn cmd_job_list(coordinator: &Coordinator, state: Option<&str>) -> Result<()> {
    let state = match state {
        Some(s) => Some(JobState::parse(s).with_context(|| format!("unknown job state '{s}'"))?),
        None => None,
    };
    let jobs = coordinator.stores().jobs.list(state).await?;
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{} {:<7} {:<10} attempt {}/{} {}",
            job.job_id,
            job.kind.as_str(),
            job.state.as_str(),
            job.attempts,
            job.max_attempts,
            job.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_job_cancel(coordinator: &Coordinator, id: &str) -> Result<()> {
    let job = coordinator.cancel(&JobId::from(id)).await?;
    if job.state == JobState::Cancelled {
        println!("Cancelled {}", job.job_id);
    } else {
        println!(
            "Cancellation requested for {} ({}); it stops before its next device change",
            job.job_id, job.state
        );
    }
    Ok(())
}

async fn cmd_pipeline_show(coordinator: &Coordinator, id: &str) -> Result<()> {
    let (record, state) = coordinator.pipeline(&PipelineId::from(id)).await?;
    println!(
        "Pipeline {} ({} on {})",
        record.pipeline_id, record.policy, record.device_id
    );
    println!("State: {}", describe(&state));
    for transition in &record.transitions {
        let name = PipelineState::from_value(&transition.state)
            .map(|s| s.name().to_string())
            .unwrap_or_else(|_| "?".to_string());
        println!(
            "  {:>3} {} {:<10} {}",
            transition.seq,
            transition.at.to_rfc3339(),
            name,
            transition.note.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_pipeline_list(coordinator: &Coordinator, device: Option<&str>) -> Result<()> {
    let device = device.map(DeviceId::from);
    let pipelines = coordinator.stores().pipelines.list(device.as_ref()).await?;
    if pipelines.is_empty() {
        println!("No pipelines");
        return Ok(());
    }
    for record in pipelines {
        let state = PipelineState::from_value(&record.state)
            .map(|s| s.name().to_string())
            .unwrap_or_else(|_| "?".to_string());
        println!(
            "{} {:<20} {:<30} {}",
            record.pipeline_id,
            record.device_id.as_str(),
            record.policy.to_string(),
            state
        );
    }
    Ok(())
}

// ========== Revisions ==========

async fn cmd_revision_history(
    coordinator: &Coordinator,
    device: &str,
    policy: &PolicyIdentity,
) -> Result<()> {
    let history = coordinator
        .ledger()
        .history(&DeviceId::from(device), policy)
        .await?;
    if history.is_empty() {
        println!("No revisions of {} on {}", policy, device);
        return Ok(());
    }
    for revision in history {
        println!(
            "{:>4} {} {:<11} {} {}",
            revision.seq,
            revision.revision_id,
            revision.status.as_str(),
            revision.fingerprint.short(),
            revision.created_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_revision_diff(coordinator: &Coordinator, from: &str, to: &str) -> Result<()> {
    let diff = coordinator
        .ledger()
        .diff(&RevisionId::from(from), &RevisionId::from(to))
        .await?;
    if diff.identical() {
        println!("Configurations are identical");
    } else {
        print!("{}", diff.render());
    }
    Ok(())
}

// ========== Workers ==========

async fn run_until_idle(coordinator: &Arc<Coordinator>, settings: WorkerSettings) -> Result<()> {
    WorkerPool::new(Arc::clone(coordinator), settings)
        .run_until_idle()
        .await?;
    Ok(())
}

async fn cmd_work(coordinator: Arc<Coordinator>, settings: WorkerSettings, until_idle: bool) -> Result<()> {
    if until_idle {
        return run_until_idle(&coordinator, settings).await;
    }
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing jobs in flight");
            let _ = tx.send(true);
        }
    });
    WorkerPool::new(coordinator, settings).run(rx).await?;
    Ok(())
}

fn cmd_config(config: &AclctlConfig) -> Result<()> {
    print!(
        "{}",
        toml::to_string_pretty(config).context("failed to render configuration")?
    );
    Ok(())
}
