//! Network management

use tracing::{debug, info};

use berth_core::error::{HookError, Result};

use crate::command::{CommandRunner, RunOptions, run_docker, to_args};
use crate::naming::label_filter;

/// Creates a labelled bridge network
pub async fn create(runner: &dyn CommandRunner, name: &str, label: &str) -> Result<()> {
    info!("Creating network {}", name);
    let args = to_args(&["network", "create", "--label", label, name]);
    run_docker(runner, &args, &RunOptions::default()).await?;
    Ok(())
}

/// Removes a network; a network that no longer exists counts as removed
pub async fn remove(runner: &dyn CommandRunner, name: &str) -> Result<()> {
    let args = to_args(&["network", "rm", name]);
    match run_docker(runner, &args, &RunOptions::default()).await {
        Ok(_) => Ok(()),
        Err(HookError::BackendCommand { message, .. }) if is_missing(&message) => {
            debug!("Network {} already removed", name);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Removes every unused network carrying the runner label
pub async fn prune(runner: &dyn CommandRunner, label: &str) -> Result<()> {
    let filter = label_filter(label);
    let args = to_args(&["network", "prune", "--force", "--filter", &filter]);
    run_docker(runner, &args, &RunOptions::default()).await?;
    Ok(())
}

/// Whether an engine error says the object does not exist
pub(crate) fn is_missing(message: &str) -> bool {
    message.to_ascii_lowercase().contains("no such")
}
