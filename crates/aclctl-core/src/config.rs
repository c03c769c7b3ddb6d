//! Configuration file (`aclctl.toml`) and environment overrides.
//!
//! Every section is optional; a missing file yields the defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compiler::ExternalCompiler;
use crate::deploy::{DeployOptions, Verification};
use crate::domain::error::{AclError, Result};
use crate::gate::{CoverageGate, GateRule};
use crate::retry::RetryPolicy;
use crate::session::ssh::SshSettings;

pub const DEFAULT_CONFIG_PATH: &str = "aclctl.toml";

/// Bounded remote calls one deploy can make back to back: open, snapshot,
/// apply, verify, restore, reopen, restore again.
pub const REMOTE_STEPS_PER_DEPLOY: u64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Percent, 0 disables the gate.
    pub min_coverage: f64,
    /// Terms that must be covered by at least one passing test.
    pub required_terms: Vec<String>,
    pub fail_fast: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_coverage: 0.0,
            required_terms: Vec::new(),
            fail_fast: false,
        }
    }
}

impl GateConfig {
    pub fn to_gate(&self) -> CoverageGate {
        self.required_terms.iter().fold(
            CoverageGate::standard(self.min_coverage).with_fail_fast(self.fail_fast),
            |gate, term| gate.with_rule(GateRule::RequireTerm { term: term.clone() }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub session_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    pub verification: Verification,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 30,
            lease_ttl_secs: 600,
            verification: Verification::default(),
        }
    }
}

impl DeployConfig {
    /// Longest a single deploy can keep a device busy, plus one step of slack.
    pub fn worst_case_secs(&self) -> u64 {
        self.session_timeout_secs
            .saturating_mul(REMOTE_STEPS_PER_DEPLOY + 1)
    }

    pub fn to_options(&self) -> DeployOptions {
        DeployOptions {
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            lease_ttl: chrono::Duration::seconds(self.lease_ttl_secs as i64),
            verification: self.verification.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// A claimed job becomes claimable again after this long.
    pub visibility_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
            visibility_timeout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Executable and leading arguments; `--platform <p>` is appended.
    pub command: Vec<String>,
    /// The compiler process is killed after this long.
    pub timeout_secs: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command: vec!["aclctl-render".to_string()],
            timeout_secs: crate::compiler::external::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl CompilerConfig {
    pub fn to_compiler(&self) -> ExternalCompiler {
        ExternalCompiler::new(self.command.clone())
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ssh_binary: String,
    pub show_command: String,
    pub apply_command: String,
    /// Run when a session opens; defaults to `show_command`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reachability_command: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let ssh = SshSettings::default();
        Self {
            ssh_binary: ssh.ssh_binary,
            show_command: ssh.show_command,
            apply_command: ssh.apply_command,
            reachability_command: ssh.reachability_command,
            connect_timeout_secs: ssh.connect_timeout_secs,
        }
    }
}

impl SessionConfig {
    pub fn to_settings(&self) -> SshSettings {
        SshSettings {
            ssh_binary: self.ssh_binary.clone(),
            show_command: self.show_command.clone(),
            apply_command: self.apply_command.clone(),
            reachability_command: self.reachability_command.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AclctlConfig {
    pub gate: GateConfig,
    pub retry: RetryPolicy,
    pub deploy: DeployConfig,
    pub worker: WorkerConfig,
    pub compiler: CompilerConfig,
    pub session: SessionConfig,
}

impl AclctlConfig {
    /// Load from `path` (default `aclctl.toml`), apply environment
    /// overrides and validate. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Self::from_toml(&contents)?
        } else {
            AclctlConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| AclError::Config(e.to_string()))
    }

    /// `ACLCTL_MIN_COVERAGE`, `ACLCTL_MAX_ATTEMPTS`, `ACLCTL_WORKERS`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ACLCTL_MIN_COVERAGE") {
            self.gate.min_coverage = parse_env("ACLCTL_MIN_COVERAGE", &v)?;
        }
        if let Some(v) = lookup("ACLCTL_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("ACLCTL_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("ACLCTL_WORKERS") {
            self.worker.concurrency = parse_env("ACLCTL_WORKERS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.gate.min_coverage) {
            return Err(AclError::Config(format!(
                "gate.min_coverage must be within 0..=100, got {}",
                self.gate.min_coverage
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(AclError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(AclError::Config("worker.concurrency must be at least 1".into()));
        }
        if self.compiler.command.is_empty() {
            return Err(AclError::Config("compiler.command must not be empty".into()));
        }
        if self.compiler.timeout_secs == 0 {
            return Err(AclError::Config("compiler.timeout_secs must be at least 1".into()));
        }
        if self.deploy.session_timeout_secs == 0 {
            return Err(AclError::Config(
                "deploy.session_timeout_secs must be at least 1".into(),
            ));
        }
        if self.deploy.lease_ttl_secs < self.deploy.worst_case_secs() {
            return Err(AclError::Config(format!(
                "deploy.lease_ttl_secs must be at least {} ({} remote steps of \
                 deploy.session_timeout_secs plus one)",
                self.deploy.worst_case_secs(),
                REMOTE_STEPS_PER_DEPLOY
            )));
        }
        if self.worker.visibility_timeout_secs < self.deploy.lease_ttl_secs {
            return Err(AclError::Config(
                "worker.visibility_timeout_secs must be at least deploy.lease_ttl_secs".into(),
            ));
        }
        if let Verification::CheckCommand {
            must_not_match: Some(pattern),
            ..
        } = &self.deploy.verification
        {
            regex::Regex::new(pattern).map_err(|e| {
                AclError::Config(format!("deploy.verification.must_not_match: {e}"))
            })?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AclError::Config(format!("{key}: cannot parse '{value}'")))
}
