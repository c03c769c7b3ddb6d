//! Policy documents: terms, test cases, normalization and fingerprinting.

use aclctl_state::{ContentDigest, PolicyFingerprint, PolicyIdentity};
use serde::{Deserialize, Serialize};

use crate::domain::digest::compute_digest;
use crate::domain::error::{AclError, Result};

/// What a term does with matching traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Accept,
    Deny,
    Next,
    Reject,
    RejectWithTcpRst,
}

/// Match qualifier on a term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TermOption {
    Established,
    IsFragment,
    TcpEstablished,
    TcpInitial,
}

/// One ordered rule of a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub name: String,
    #[serde(default)]
    pub source_networks: Vec<String>,
    #[serde(default)]
    pub destination_networks: Vec<String>,
    #[serde(default)]
    pub source_services: Vec<String>,
    #[serde(default)]
    pub destination_services: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<TermOption>,
    #[serde(default)]
    pub logging: bool,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Term {
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            source_networks: Vec::new(),
            destination_networks: Vec::new(),
            source_services: Vec::new(),
            destination_services: Vec::new(),
            protocols: Vec::new(),
            option: None,
            logging: false,
            action,
            comment: None,
        }
    }

    fn normalized(&self) -> Term {
        Term {
            name: self.name.trim().to_string(),
            source_networks: sorted_unique(&self.source_networks),
            destination_networks: sorted_unique(&self.destination_networks),
            source_services: sorted_unique(&self.source_services),
            destination_services: sorted_unique(&self.destination_services),
            protocols: sorted_unique(
                &self
                    .protocols
                    .iter()
                    .map(|p| p.to_ascii_lowercase())
                    .collect::<Vec<_>>(),
            ),
            option: self.option,
            logging: self.logging,
            action: self.action,
            comment: None,
        }
    }
}

/// A traffic sample with the action the policy is expected to take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub expected_action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// An ACL policy targeting one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default = "default_action")]
    pub default_action: Action,
    pub terms: Vec<Term>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

fn default_action() -> Action {
    Action::Deny
}

fn sorted_unique(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

impl Policy {
    pub fn new(name: impl Into<String>, platform: impl Into<String>, terms: Vec<Term>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            comment: None,
            default_action: Action::Deny,
            terms,
            tests: Vec::new(),
        }
    }

    pub fn with_tests(mut self, tests: Vec<TestCase>) -> Self {
        self.tests = tests;
        self
    }

    /// Structural checks the compiler should never have to report.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AclError::InvalidPolicy("policy name is empty".to_string()));
        }
        if self.platform.trim().is_empty() {
            return Err(AclError::InvalidPolicy(format!(
                "policy {} has no platform",
                self.name
            )));
        }
        if self.terms.is_empty() {
            return Err(AclError::InvalidPolicy(format!(
                "policy {} has no terms",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for term in &self.terms {
            let name = term.name.trim();
            if name.is_empty() {
                return Err(AclError::InvalidPolicy("term name is empty".to_string()));
            }
            if !seen.insert(name) {
                return Err(AclError::InvalidPolicy(format!("duplicate term {name}")));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for test in &self.tests {
            if !seen.insert(test.name.trim()) {
                return Err(AclError::InvalidPolicy(format!(
                    "duplicate test {}",
                    test.name.trim()
                )));
            }
        }
        Ok(())
    }

    /// Canonical form used for fingerprinting and compilation.
    ///
    /// Term order is kept: it decides which rule matches first.
    pub fn normalized(&self) -> Policy {
        let mut tests: Vec<TestCase> = self
            .tests
            .iter()
            .map(|t| TestCase {
                name: t.name.trim().to_string(),
                protocol: t.protocol.as_ref().map(|p| p.to_ascii_lowercase()),
                ..t.clone()
            })
            .collect();
        tests.sort_by(|a, b| a.name.cmp(&b.name));

        Policy {
            name: self.name.trim().replace(' ', "-"),
            platform: self.platform.trim().to_ascii_lowercase(),
            comment: None,
            default_action: self.default_action,
            terms: self.terms.iter().map(Term::normalized).collect(),
            tests,
        }
    }

    /// Filter name rendered into device configuration.
    pub fn filter_name(&self) -> String {
        self.name.trim().replace(' ', "-").to_ascii_lowercase()
    }

    pub fn identity(&self) -> PolicyIdentity {
        let n = self.normalized();
        PolicyIdentity::new(n.name, n.platform)
    }

    pub fn term_names(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.name.trim().to_string()).collect()
    }

    /// JSON document handed to the compiler.
    pub fn document(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Digest over the normalized document (platform included).
    pub fn fingerprint(&self) -> Result<PolicyFingerprint> {
        let digest = compute_digest(&self.normalized().document()?)?;
        Ok(ContentDigest::try_from(digest)?)
    }

    pub fn from_document(document: &serde_json::Value) -> Result<Policy> {
        serde_json::from_value(document.clone())
            .map_err(|e| AclError::InvalidPolicy(format!("unreadable policy document: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ssh_policy() -> Policy {
        let mut allow = Term::new("allow-ssh", Action::Accept);
        allow.source_networks = vec!["10.0.0.0/8".into(), "192.168.0.0/16".into()];
        allow.destination_services = vec!["ssh".into()];
        allow.protocols = vec!["TCP".into()];
        Policy::new("edge in", "Juniper", vec![allow, Term::new("deny-all", Action::Deny)])
    }

    #[test]
    fn test_normalization_sorts_lists_but_keeps_term_order() {
        let mut p = ssh_policy();
        p.terms[0].source_networks.reverse();
        p.terms[0].source_networks.push("10.0.0.0/8".into());
        let n = p.normalized();
        assert_eq!(n.name, "edge-in");
        assert_eq!(n.platform, "juniper");
        assert_eq!(n.terms[0].source_networks, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert_eq!(n.terms[0].protocols, vec!["tcp"]);
        assert_eq!(n.term_names(), vec!["allow-ssh", "deny-all"]);
    }

    #[test]
    fn test_fingerprint_ignores_authoring_noise() {
        let a = ssh_policy();
        let mut b = ssh_policy();
        b.comment = Some("written by a different team".into());
        b.terms[0].source_networks.reverse();
        b.terms[0].comment = Some("ops".into());
        b.platform = " juniper ".into();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_fingerprint_depends_on_platform_and_term_order() {
        let a = ssh_policy();
        let mut other_platform = ssh_policy();
        other_platform.platform = "cisco".into();
        assert_ne!(a.fingerprint().unwrap(), other_platform.fingerprint().unwrap());

        let mut reordered = ssh_policy();
        reordered.terms.reverse();
        assert_ne!(a.fingerprint().unwrap(), reordered.fingerprint().unwrap());
    }

    #[test]
    fn test_identity_uses_normalized_name() {
        let id = ssh_policy().identity();
        assert_eq!(id.key(), "edge-in@juniper");
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty() {
        let mut p = ssh_policy();
        p.terms.push(Term::new("deny-all", Action::Deny));
        assert!(matches!(p.validate(), Err(AclError::InvalidPolicy(_))));

        let empty = Policy::new("x", "juniper", vec![]);
        assert!(empty.validate().is_err());
        assert!(ssh_policy().validate().is_ok());
    }

    #[test]
    fn test_from_document_defaults() {
        let doc = json!({
            "name": "lab",
            "platform": "juniper",
            "terms": [{"name": "t1", "action": "reject-with-tcp-rst"}]
        });
        let p = Policy::from_document(&doc).unwrap();
        assert_eq!(p.default_action, Action::Deny);
        assert_eq!(p.terms[0].action, Action::RejectWithTcpRst);
        assert!(p.tests.is_empty());
    }

    #[test]
    fn test_from_document_rejects_garbage() {
        let err = Policy::from_document(&json!({"name": 3})).unwrap_err();
        assert!(matches!(err, AclError::InvalidPolicy(_)));
    }
}
