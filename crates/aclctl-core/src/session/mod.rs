//! Remote management sessions.
//!
//! aclctl does not speak a transport protocol itself. A [`SessionFactory`]
//! opens an authenticated [`DeviceSession`] that can read the running
//! configuration, apply a configuration text and run a check command.

pub mod ssh;

use std::sync::Arc;

use aclctl_state::DeviceRecord;
use async_trait::async_trait;

pub use ssh::SshCommandSessionFactory;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("command `{command}` failed (status {status}): {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("io: {0}")]
    Io(String),
}

impl TransportError {
    /// Failures that say nothing about the configuration itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Auth(_) | TransportError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// An open, authenticated session to one device.
#[async_trait]
pub trait DeviceSession: Send {
    async fn get_running_config(&mut self) -> Result<String, TransportError>;

    /// Apply `config`; returns whatever the device printed.
    async fn apply_config(&mut self, config: &str) -> Result<String, TransportError>;

    async fn run_check(&mut self, command: &str) -> Result<String, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, device: &DeviceRecord) -> Result<Box<dyn DeviceSession>, TransportError>;
}

/// Login material resolved from a device's credential reference.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    /// Path to a private key, if key authentication is used
    pub key_path: Option<String>,
    /// Overrides the device's management port
    pub port: Option<u16>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("key_path", &self.key_path.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .finish()
    }
}

/// Resolves a credential reference; devices never store secrets.
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, credential_ref: &str) -> Result<Credentials, TransportError>;
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Credentials from `ACLCTL_CRED_<NAME>_USER`, `_KEY` and `_PORT`, where
/// `NAME` is the reference uppercased with non-alphanumerics as `_`.
#[derive(Clone)]
pub struct EnvCredentialStore {
    lookup: Lookup,
}

impl EnvCredentialStore {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var_prefix(credential_ref: &str) -> String {
        let name: String = credential_ref
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("ACLCTL_CRED_{name}")
    }
}

impl std::fmt::Debug for EnvCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvCredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore for EnvCredentialStore {
    fn resolve(&self, credential_ref: &str) -> Result<Credentials, TransportError> {
        let prefix = Self::var_prefix(credential_ref);
        let username = (self.lookup)(&format!("{prefix}_USER")).ok_or_else(|| {
            TransportError::Auth(format!(
                "no credentials for reference '{credential_ref}' ({prefix}_USER not set)"
            ))
        })?;
        let key_path = (self.lookup)(&format!("{prefix}_KEY"));
        let port = match (self.lookup)(&format!("{prefix}_PORT")) {
            Some(p) => Some(p.parse::<u16>().map_err(|_| {
                TransportError::Auth(format!("{prefix}_PORT is not a port number: {p}"))
            })?),
            None => None,
        };
        Ok(Credentials {
            username,
            key_path,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn store(vars: &[(&str, &str)]) -> EnvCredentialStore {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvCredentialStore::from_lookup(move |k| vars.get(k).cloned())
    }

    #[test]
    fn test_env_credentials_resolve() {
        let s = store(&[
            ("ACLCTL_CRED_CORE_RO_USER", "netops"),
            ("ACLCTL_CRED_CORE_RO_KEY", "/keys/core"),
            ("ACLCTL_CRED_CORE_RO_PORT", "2222"),
        ]);
        let c = s.resolve("core-ro").unwrap();
        assert_eq!(c.username, "netops");
        assert_eq!(c.key_path.as_deref(), Some("/keys/core"));
        assert_eq!(c.port, Some(2222));
    }

    #[test]
    fn test_missing_user_is_auth_error() {
        let err = store(&[]).resolve("lab").unwrap_err();
        assert!(matches!(err, TransportError::Auth(_)));
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_bad_port() {
        let s = store(&[("ACLCTL_CRED_LAB_USER", "u"), ("ACLCTL_CRED_LAB_PORT", "ssh")]);
        assert!(s.resolve("lab").is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let c = Credentials {
            username: "u".into(),
            key_path: Some("/secret".into()),
            port: None,
        };
        assert!(!format!("{c:?}").contains("/secret"));
    }
}
