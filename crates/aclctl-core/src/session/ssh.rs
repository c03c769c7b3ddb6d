//! Session back-end driving the system `ssh` client.
//!
//! Every operation is one non-interactive `ssh` invocation. Exit status 255
//! (the client's own failure) or a spawn failure means the device could not
//! be reached; any other non-zero status is a failed remote command.

use std::process::Stdio;
use std::sync::Arc;

use aclctl_state::DeviceRecord;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{CredentialStore, Credentials, DeviceSession, SessionFactory, TransportError};

const SSH_CLIENT_FAILURE: i32 = 255;

/// Settings shared by every session the factory opens.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub ssh_binary: String,
    /// Prints the running configuration
    pub show_command: String,
    /// Reads a configuration on stdin and applies it
    pub apply_command: String,
    /// Read-only command run when a session opens; `show_command` when unset
    pub reachability_command: Option<String>,
    pub connect_timeout_secs: u64,
}

impl SshSettings {
    pub fn reachability_command(&self) -> &str {
        self.reachability_command
            .as_deref()
            .unwrap_or(&self.show_command)
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            show_command: "show configuration".to_string(),
            apply_command: "load replace terminal".to_string(),
            reachability_command: None,
            connect_timeout_secs: 10,
        }
    }
}

pub struct SshCommandSessionFactory {
    settings: SshSettings,
    credentials: Arc<dyn CredentialStore>,
}

impl SshCommandSessionFactory {
    pub fn new(settings: SshSettings, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            settings,
            credentials,
        }
    }
}

impl std::fmt::Debug for SshCommandSessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCommandSessionFactory")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionFactory for SshCommandSessionFactory {
    async fn open(&self, device: &DeviceRecord) -> Result<Box<dyn DeviceSession>, TransportError> {
        let credentials = self.credentials.resolve(&device.credential_ref)?;
        let mut session = SshCommandSession {
            settings: self.settings.clone(),
            address: device.address.clone(),
            port: credentials.port.or(device.port),
            credentials,
        };
        // Unreachable devices fail here, before any mutation.
        let check = session.settings.reachability_command().to_string();
        session.exec(&check, None).await?;
        Ok(Box::new(session))
    }
}

struct SshCommandSession {
    settings: SshSettings,
    address: String,
    port: Option<u16>,
    credentials: Credentials,
}

impl SshCommandSession {
    fn args(&self, remote: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(key) = &self.credentials.key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push("-l".to_string());
        args.push(self.credentials.username.clone());
        args.push(self.address.clone());
        args.push(remote.to_string());
        args
    }

    async fn exec(&mut self, remote: &str, stdin: Option<&str>) -> Result<String, TransportError> {
        debug!(address = %self.address, command = %remote, "ssh exec");
        let mut child = Command::new(&self.settings.ssh_binary)
            .args(self.args(remote))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::Unreachable(format!(
                    "cannot start {}: {e}",
                    self.settings.ssh_binary
                ))
            })?;

        // Write stdin while the output drains so a chatty device cannot
        // fill the stdout pipe and stall the write.
        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(text), Some(mut pipe)) = (stdin, pipe) {
                match pipe.write_all(text.as_bytes()).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };
        let ((), output) = tokio::try_join!(feed, child.wait_with_output())?;
        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match status {
            0 => Ok(String::from_utf8_lossy(&output.stdout).to_string()),
            SSH_CLIENT_FAILURE if stderr.contains("Permission denied") => {
                Err(TransportError::Auth(stderr))
            }
            SSH_CLIENT_FAILURE => Err(TransportError::Unreachable(stderr)),
            _ => Err(TransportError::Command {
                command: remote.to_string(),
                status,
                stderr,
            }),
        }
    }
}

#[async_trait]
impl DeviceSession for SshCommandSession {
    async fn get_running_config(&mut self) -> Result<String, TransportError> {
        let show = self.settings.show_command.clone();
        self.exec(&show, None).await
    }

    async fn apply_config(&mut self, config: &str) -> Result<String, TransportError> {
        let apply = self.settings.apply_command.clone();
        self.exec(&apply, Some(config)).await
    }

    async fn run_check(&mut self, command: &str) -> Result<String, TransportError> {
        self.exec(command, None).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
