//! Hook invocation DTOs
//!
//! The JSON object the runner writes to the hook's stdin.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::domain::state::JobState;
use crate::error::{HookError, Result};

/// Lifecycle event the hook is invoked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HookCommand {
    PrepareJob,
    CleanupJob,
    RunScriptStep,
    RunContainerStep,
}

impl HookCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrepareJob => "prepare_job",
            Self::CleanupJob => "cleanup_job",
            Self::RunScriptStep => "run_script_step",
            Self::RunContainerStep => "run_container_step",
        }
    }
}

impl TryFrom<String> for HookCommand {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            "prepare_job" => Ok(Self::PrepareJob),
            "cleanup_job" => Ok(Self::CleanupJob),
            "run_script_step" => Ok(Self::RunScriptStep),
            "run_container_step" => Ok(Self::RunContainerStep),
            other => Err(format!("Command not recognized: {}", other)),
        }
    }
}

impl From<HookCommand> for String {
    fn from(command: HookCommand) -> Self {
        command.as_str().to_string()
    }
}

impl fmt::Display for HookCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hook invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookInput {
    pub command: HookCommand,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub state: serde_json::Value,
    pub response_file: Option<PathBuf>,
}

impl HookInput {
    /// Parses the hook payload
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Decodes the command-specific arguments
    pub fn args<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.args.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.args.clone()).map_err(|e| {
            HookError::InvalidInput(format!("invalid arguments for {}: {}", self.command, e))
        })
    }

    /// Decodes the state blob; `null` and `{}` mean no state
    pub fn state(&self) -> Result<Option<JobState>> {
        match &self.state {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Object(map) if map.is_empty() => Ok(None),
            value => {
                let state: JobState = serde_json::from_value(value.clone()).map_err(|e| {
                    HookError::StateMismatch(format!("unreadable job state: {}", e))
                })?;
                state.check_version()?;
                Ok(Some(state))
            }
        }
    }
}
