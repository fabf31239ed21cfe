//! Command arguments
//!
//! Per-command argument payloads sent by the runner.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::domain::container::{ContainerSpec, ServiceSpec, null_as_default};

/// Arguments of `prepare_job`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareJobArgs {
    pub container: Option<ContainerSpec>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub services: Vec<ServiceSpec>,
}

impl PrepareJobArgs {
    /// The job container, only when it names an image
    pub fn job_container(&self) -> Option<&ContainerSpec> {
        self.container
            .as_ref()
            .filter(|c| c.image.as_deref().is_some_and(|i| !i.is_empty()))
    }

    /// Whether there is anything to create at all
    pub fn is_empty(&self) -> bool {
        self.job_container().is_none() && self.services.is_empty()
    }
}

/// Arguments of `run_script_step`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScriptStepArgs {
    pub entry_point: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub entry_point_args: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "prepend_path")]
    pub prepend_path: Vec<String>,
    pub working_directory: String,
}

/// Arguments of `run_container_step`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContainerStepArgs {
    #[serde(flatten)]
    pub container: ContainerSpec,
    /// Build the step image from this Dockerfile instead of pulling
    pub dockerfile: Option<String>,
    #[serde(default, deserialize_with = "prepend_path")]
    pub prepend_path: Vec<String>,
}

/// Accepts `prependPath` as either a list or a single `:`-joined string
fn prepend_path<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::List(list)) => list,
        Some(Raw::Joined(joined)) if !joined.is_empty() => vec![joined],
        _ => Vec::new(),
    })
}
