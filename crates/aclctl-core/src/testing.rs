//! Scripted collaborators for tests and dry runs: compilers that never shell
//! out and a simulated device network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aclctl_state::{DeviceId, DeviceRecord};
use async_trait::async_trait;

use crate::compiler::{CompilerFailure, PolicyCompiler, Rendered};
use crate::coordinator::Coordinator;
use crate::domain::error::Result;
use crate::domain::policy::{Action, Policy, Term};
use crate::session::{DeviceSession, SessionFactory, TransportError};
use crate::worker::{WorkerPool, WorkerSettings};

// ---------------------------------------------------------------------------
// Compilers
// ---------------------------------------------------------------------------

/// Renders every policy to `filter <name> { <term>; ... }` with a fixed
/// coverage score, counting invocations.
#[derive(Debug)]
pub struct StaticCompiler {
    coverage: f64,
    matched_terms: Option<Vec<String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticCompiler {
    pub fn new(coverage: f64) -> Self {
        Self {
            coverage,
            matched_terms: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Report matched terms instead of a score.
    pub fn with_matched_terms(terms: &[&str]) -> Self {
        Self {
            matched_terms: Some(terms.iter().map(|t| t.to_string()).collect()),
            ..Self::new(0.0)
        }
    }

    /// Block the rendering thread, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PolicyCompiler for StaticCompiler {
    fn render(
        &self,
        document: &serde_json::Value,
        platform: &str,
    ) -> std::result::Result<Rendered, CompilerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let policy = Policy::from_document(document)
            .map_err(|e| CompilerFailure::new(e.to_string()))?;
        let mut config = format!("filter {} {{ # {platform}\n", policy.filter_name());
        for term in &policy.terms {
            config.push_str(&format!("  term {} {:?};\n", term.name, term.action));
        }
        config.push_str("}\n");
        Ok(Rendered {
            config_text: config,
            coverage_score: self.matched_terms.is_none().then_some(self.coverage),
            matched_terms: self.matched_terms.clone(),
            diagnostics: Vec::new(),
        })
    }
}

/// Rejects every policy with fixed diagnostics.
#[derive(Debug)]
pub struct FailingCompiler {
    diagnostics: String,
    calls: AtomicUsize,
}

impl FailingCompiler {
    pub fn new(diagnostics: impl Into<String>) -> Self {
        Self {
            diagnostics: diagnostics.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PolicyCompiler for FailingCompiler {
    fn render(
        &self,
        _document: &serde_json::Value,
        _platform: &str,
    ) -> std::result::Result<Rendered, CompilerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CompilerFailure::new(self.diagnostics.clone()))
    }
}

// ---------------------------------------------------------------------------
// Simulated devices
// ---------------------------------------------------------------------------

/// How a simulated device misbehaves.
#[derive(Debug, Clone, Default)]
pub struct DeviceBehavior {
    /// The first N opens never complete.
    pub hang_opens: u32,
    /// After the hanging ones, the next N opens fail as unreachable.
    pub unreachable_opens: u32,
    /// The deploy apply fails with a command error.
    pub apply_fails: bool,
    /// The deploy apply reports success but changes nothing.
    pub ignore_apply: bool,
    /// Output of every check command (default: the running config).
    pub check_output: Option<String>,
    /// Applies after the first in a session (rollbacks) fail.
    pub rollback_fails: bool,
    /// Delay inside the deploy apply.
    pub apply_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct FakeDevice {
    running: String,
    behavior: DeviceBehavior,
    opens: u32,
    applies: Vec<String>,
    rollbacks: u32,
    active_sessions: usize,
    max_active_sessions: usize,
}

/// A set of simulated devices behind a [`SessionFactory`].
#[derive(Debug, Clone, Default)]
pub struct FakeNetwork {
    devices: Arc<Mutex<HashMap<DeviceId, FakeDevice>>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device_id: &str, running: &str) {
        self.devices.lock().unwrap().insert(
            DeviceId::from(device_id),
            FakeDevice {
                running: running.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn set_behavior(&self, device_id: &str, behavior: DeviceBehavior) {
        if let Some(d) = self.devices.lock().unwrap().get_mut(&DeviceId::from(device_id)) {
            d.behavior = behavior;
        }
    }

    pub fn running_config(&self, device_id: &str) -> String {
        self.with(device_id, |d| d.running.clone())
    }

    /// Deploy applies that took effect.
    pub fn applies(&self, device_id: &str) -> Vec<String> {
        self.with(device_id, |d| d.applies.clone())
    }

    pub fn rollbacks(&self, device_id: &str) -> u32 {
        self.with(device_id, |d| d.rollbacks)
    }

    pub fn opens(&self, device_id: &str) -> u32 {
        self.with(device_id, |d| d.opens)
    }

    pub fn max_concurrent_sessions(&self, device_id: &str) -> usize {
        self.with(device_id, |d| d.max_active_sessions)
    }

    fn with<T>(&self, device_id: &str, f: impl FnOnce(&FakeDevice) -> T) -> T {
        let devices = self.devices.lock().unwrap();
        f(devices
            .get(&DeviceId::from(device_id))
            .expect("unknown fake device"))
    }
}

#[async_trait]
impl SessionFactory for FakeNetwork {
    async fn open(&self, device: &DeviceRecord) -> std::result::Result<Box<dyn DeviceSession>, TransportError> {
        let (hang, unreachable) = {
            let mut devices = self.devices.lock().unwrap();
            let d = devices
                .get_mut(&device.device_id)
                .ok_or_else(|| TransportError::Unreachable(format!("no route to {}", device.address)))?;
            d.opens += 1;
            let hang = d.opens <= d.behavior.hang_opens;
            let unreachable =
                !hang && d.opens <= d.behavior.hang_opens + d.behavior.unreachable_opens;
            if !hang && !unreachable {
                d.active_sessions += 1;
                d.max_active_sessions = d.max_active_sessions.max(d.active_sessions);
            }
            (hang, unreachable)
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            return Err(TransportError::Unreachable("hung".into()));
        }
        if unreachable {
            return Err(TransportError::Unreachable(format!(
                "connection to {} refused",
                device.address
            )));
        }
        Ok(Box::new(FakeSession {
            devices: Arc::clone(&self.devices),
            device_id: device.device_id.clone(),
            applies: 0,
            closed: false,
        }))
    }
}

struct FakeSession {
    devices: Arc<Mutex<HashMap<DeviceId, FakeDevice>>>,
    device_id: DeviceId,
    applies: u32,
    closed: bool,
}

impl FakeSession {
    fn device<T>(&self, f: impl FnOnce(&mut FakeDevice) -> T) -> T {
        let mut devices = self.devices.lock().unwrap();
        f(devices.get_mut(&self.device_id).expect("fake device removed"))
    }
}

#[async_trait]
impl DeviceSession for FakeSession {
    async fn get_running_config(&mut self) -> std::result::Result<String, TransportError> {
        Ok(self.device(|d| d.running.clone()))
    }

    async fn apply_config(&mut self, config: &str) -> std::result::Result<String, TransportError> {
        self.applies += 1;
        if self.applies == 1 {
            let delay = self.device(|d| d.behavior.apply_delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            return self.device(|d| {
                if d.behavior.apply_fails {
                    return Err(TransportError::Command {
                        command: "load".into(),
                        status: 1,
                        stderr: "syntax error".into(),
                    });
                }
                if !d.behavior.ignore_apply {
                    d.running = config.to_string();
                    d.applies.push(config.to_string());
                }
                Ok("load complete".to_string())
            });
        }
        self.device(|d| {
            if d.behavior.rollback_fails {
                return Err(TransportError::Command {
                    command: "load".into(),
                    status: 1,
                    stderr: "commit failed".into(),
                });
            }
            d.running = config.to_string();
            d.rollbacks += 1;
            Ok("rollback complete".to_string())
        })
    }

    async fn run_check(&mut self, _command: &str) -> std::result::Result<String, TransportError> {
        Ok(self.device(|d| d.behavior.check_output.clone().unwrap_or_else(|| d.running.clone())))
    }

    async fn close(&mut self) -> std::result::Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.device(|d| d.active_sessions = d.active_sessions.saturating_sub(1));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn device(device_id: &str, platform: &str) -> DeviceRecord {
    DeviceRecord {
        device_id: DeviceId::from(device_id),
        address: format!("{device_id}.lab.example.net"),
        port: None,
        credential_ref: "lab".to_string(),
        platform: platform.to_string(),
        current_revision: None,
    }
}

/// Two-term policy: `allow-ssh` then `deny-all`.
pub fn sample_policy(name: &str, platform: &str) -> Policy {
    let mut allow = Term::new("allow-ssh", Action::Accept);
    allow.source_networks = vec!["10.0.0.0/8".to_string()];
    allow.destination_services = vec!["ssh".to_string()];
    allow.protocols = vec!["tcp".to_string()];
    Policy::new(name, platform, vec![allow, Term::new("deny-all", Action::Deny)])
}

/// Run a small worker pool until the queue is empty.
pub async fn drain(coordinator: &Arc<Coordinator>, workers: usize) -> Result<()> {
    let settings = WorkerSettings {
        concurrency: workers.max(1),
        poll_interval: Duration::from_millis(5),
        visibility_timeout: chrono::Duration::seconds(300),
        name: "test".to_string(),
    };
    WorkerPool::new(Arc::clone(coordinator), settings)
        .run_until_idle()
        .await
}
