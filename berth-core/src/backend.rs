//! Backend abstraction
//!
//! The four lifecycle operations every container backend provides. The hook
//! binary selects one implementation from configuration at startup and
//! dispatches each invocation to it.

use async_trait::async_trait;

use crate::domain::context::PrepareJobResponse;
use crate::domain::state::JobState;
use crate::dto::args::{PrepareJobArgs, RunContainerStepArgs, RunScriptStepArgs};
use crate::error::Result;

/// Container lifecycle backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Creates the job container and services, waits until they are usable
    ///
    /// On failure every resource labelled for this runner is pruned before
    /// the error is returned.
    async fn prepare_job(&self, args: PrepareJobArgs) -> Result<PrepareJobResponse>;

    /// Runs one script inside the job container, streaming its output
    ///
    /// A non-zero exit of the script is an error.
    async fn run_script_step(&self, args: RunScriptStepArgs, state: &JobState) -> Result<()>;

    /// Runs one step in its own container and returns the step's exit code
    async fn run_container_step(
        &self,
        args: RunContainerStepArgs,
        state: Option<&JobState>,
    ) -> Result<i32>;

    /// Removes everything the job created
    ///
    /// Best effort: every resource is attempted even when some deletions fail.
    async fn cleanup_job(&self, state: Option<&JobState>) -> Result<()>;
}
