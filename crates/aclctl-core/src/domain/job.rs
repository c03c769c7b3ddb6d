//! Payloads carried by `build` and `deploy` jobs.

use aclctl_state::{DeviceId, PipelineId, PolicyIdentity, RevisionId};
use serde::{Deserialize, Serialize};

use crate::domain::error::Result;

/// One device a build fans out to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTarget {
    pub device_id: DeviceId,
    pub pipeline_id: PipelineId,
}

/// Compile the latest version of `policy` for every target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPayload {
    pub policy: PolicyIdentity,
    pub targets: Vec<BuildTarget>,
}

/// Apply one committed revision to one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployPayload {
    pub policy: PolicyIdentity,
    pub device_id: DeviceId,
    pub revision_id: RevisionId,
    pub pipeline_id: PipelineId,
}

macro_rules! json_payload {
    ($name:ident) => {
        impl $name {
            pub fn to_value(&self) -> Result<serde_json::Value> {
                Ok(serde_json::to_value(self)?)
            }

            pub fn from_value(value: &serde_json::Value) -> Result<Self> {
                Ok(serde_json::from_value(value.clone())?)
            }
        }
    };
}

json_payload!(BuildPayload);
json_payload!(DeployPayload);
