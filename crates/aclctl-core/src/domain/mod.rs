//! Domain models for aclctl.
//!
//! Canonical definitions for the core entities:
//! - `Policy`: ordered ACL terms plus test cases, for one platform
//! - `BuildPayload` / `DeployPayload`: what queued jobs carry
//! - `AclError`: the failure taxonomy the pipeline reacts to

pub mod digest;
pub mod error;
pub mod job;
pub mod policy;

// Re-export main types and errors
pub use error::{AclError, Result};
pub use job::{BuildPayload, BuildTarget, DeployPayload};
pub use policy::{Action, Policy, Term, TermOption, TestCase};
