//! Image pull and build

use std::path::{Path, PathBuf};
use tracing::info;

use berth_core::domain::container::Registry;
use berth_core::error::{HookError, Result};

use crate::command::{CommandRunner, RunOptions, display_command, run_docker, to_args};
use crate::registry::CredentialStore;

/// Pull attempts before giving up
pub const PULL_ATTEMPTS: u32 = 3;

/// Pulls an image, retrying up to [`PULL_ATTEMPTS`] times
pub async fn pull(
    runner: &dyn CommandRunner,
    image: &str,
    config_dir: Option<&Path>,
) -> Result<()> {
    let mut args = Vec::new();
    if let Some(dir) = config_dir {
        args.push("--config".to_string());
        args.push(dir.to_string_lossy().to_string());
    }
    args.extend(to_args(&["pull", image]));

    let mut last_error = String::new();
    for attempt in 1..=PULL_ATTEMPTS {
        match run_docker(runner, &args, &RunOptions::default()).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                info!("docker pull failed on attempt: {}", attempt);
                last_error = e.to_string();
            }
        }
    }

    Err(HookError::backend(
        display_command(&args),
        format!(
            "Exiting docker pull after {} failed attempts: {}",
            PULL_ATTEMPTS, last_error
        ),
    ))
}

/// Pulls an image inside a login/logout bracket when a registry is given
pub async fn pull_with_registry(
    runner: &dyn CommandRunner,
    temp_dir: &Path,
    image: &str,
    registry: Option<&Registry>,
) -> Result<()> {
    let Some(registry) = registry else {
        return pull(runner, image, None).await;
    };

    let store = CredentialStore::login(runner, temp_dir, registry).await?;
    let result = pull(runner, image, Some(store.dir())).await;
    store.logout(runner).await;
    result
}

/// Builds `dockerfile` into `tag`, using its directory as build context
pub async fn build(
    runner: &dyn CommandRunner,
    dockerfile: &str,
    tag: &str,
    workspace: &Path,
) -> Result<()> {
    let path = Path::new(dockerfile);
    let context = path
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());

    info!("Building {} from {}", tag, dockerfile);
    let args = to_args(&["build", "-t", tag, "-f", dockerfile, &context]);
    let opts = RunOptions {
        cwd: Some(build_working_dir(path, workspace)),
        ..Default::default()
    };
    run_docker(runner, &args, &opts).await?;
    Ok(())
}

/// Directory the build runs from
///
/// Dockerfiles inside the workspace build from the workspace. Container
/// actions live under `_actions/<owner>/<repo>/<ref>` and build from there.
pub fn build_working_dir(dockerfile: &Path, workspace: &Path) -> PathBuf {
    if dockerfile.starts_with(workspace) {
        return workspace.to_path_buf();
    }

    let components: Vec<_> = dockerfile.components().collect();
    match components.iter().position(|c| c.as_os_str() == "_actions") {
        Some(index) => components.iter().take(index + 4).collect(),
        None => workspace.to_path_buf(),
    }
}
