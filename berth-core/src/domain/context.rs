//! Response context
//!
//! What `prepare_job` reports back to the runner: the state blob plus a
//! backend-independent description of the containers and their ports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::state::JobState;

/// Container port (key) to host port (value), both decimal strings
pub type ContextPorts = BTreeMap<String, String>;

/// One container as seen by later steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default)]
    pub ports: ContextPorts,
}

/// Containers created by `prepare_job`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ContainerContext>,
}

/// Contents of the response file written after `prepare_job`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareJobResponse {
    pub state: JobState,
    pub context: ResponseContext,
    pub is_alpine: bool,
}
