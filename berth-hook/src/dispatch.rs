//! Hook dispatcher
//!
//! Routes one decoded invocation to the active backend and writes the
//! `prepare_job` response file.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use berth_core::backend::Backend;
use berth_core::domain::context::PrepareJobResponse;
use berth_core::dto::args::{PrepareJobArgs, RunContainerStepArgs, RunScriptStepArgs};
use berth_core::dto::hook::{HookCommand, HookInput};
use berth_core::error::HookError;

/// Runs one hook command, returning the exit code to report
///
/// Every command but `run_container_step` exits 0 on success; a container
/// step reports its container's exit code.
pub async fn dispatch(backend: &dyn Backend, input: &HookInput) -> Result<i32> {
    match input.command {
        HookCommand::PrepareJob => {
            let response_file = input.response_file.as_deref().ok_or_else(|| {
                HookError::InvalidInput("prepare_job requires a responseFile".to_string())
            })?;
            let args: PrepareJobArgs = input.args()?;
            let response = backend.prepare_job(args).await?;
            write_response(response_file, &response).await?;
            info!("Job prepared, response written to {}", response_file.display());
            Ok(0)
        }
        HookCommand::CleanupJob => {
            let state = input.state()?;
            backend.cleanup_job(state.as_ref()).await?;
            Ok(0)
        }
        HookCommand::RunScriptStep => {
            let state = input.state()?.ok_or_else(|| {
                HookError::StateMismatch(
                    "run_script_step requires the state written by prepare_job".to_string(),
                )
            })?;
            let args: RunScriptStepArgs = input.args()?;
            backend.run_script_step(args, &state).await?;
            Ok(0)
        }
        HookCommand::RunContainerStep => {
            let state = input.state()?;
            let args: RunContainerStepArgs = input.args()?;
            let exit_code = backend.run_container_step(args, state.as_ref()).await?;
            info!("Container step exited with code {}", exit_code);
            Ok(exit_code)
        }
    }
}

async fn write_response(path: &Path, response: &PrepareJobResponse) -> Result<()> {
    let json = serde_json::to_string(response)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write response file {}", path.display()))
}
