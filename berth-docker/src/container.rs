//! Container operations
//!
//! Argument construction and lifecycle calls for job, service and step
//! containers.

use std::collections::BTreeMap;
use tracing::{debug, info};

use berth_core::backoff::{Backoff, Step, poll_until};
use berth_core::domain::container::{ALPINE_PROBE, ContainerSpec};
use berth_core::domain::health::ContainerHealth;
use berth_core::dto::args::RunScriptStepArgs;
use berth_core::error::{HookError, Result};
use berth_core::ports::parse_port_mappings;

use crate::command::{CommandRunner, RunOptions, display_command, run_docker, to_args};
use crate::naming::label_filter;
use crate::network::is_missing;

/// Health polls before a `starting` container is given up on
pub const HEALTH_ATTEMPTS: u32 = 13;

const HEALTH_FORMAT: &str =
    "--format={{if .Config.Healthcheck}}{{print .State.Health.Status}}{{end}}";

/// A started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedContainer {
    pub id: String,
    pub image: String,
}

/// `-e KEY` pairs; values travel in the process environment
fn env_args(env: &BTreeMap<String, String>) -> Vec<String> {
    env.keys()
        .flat_map(|key| ["-e".to_string(), key.clone()])
        .collect()
}

fn mount_args(spec: &ContainerSpec) -> Vec<String> {
    spec.mounts()
        .flat_map(|mount| {
            let mut volume = format!("{}:{}", mount.source_volume_path, mount.target_volume_path);
            if mount.read_only {
                volume.push_str(":ro");
            }
            ["-v".to_string(), volume]
        })
        .collect()
}

fn entrypoint_and_image(spec: &ContainerSpec, image: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(entry_point) = spec.entry_point.as_deref().filter(|e| !e.is_empty()) {
        args.push("--entrypoint".to_string());
        args.push(entry_point.to_string());
    }
    args.push(image.to_string());
    args.extend(
        spec.entry_point_args
            .iter()
            .filter(|arg| !arg.is_empty())
            .cloned(),
    );
    args
}

/// Arguments of `docker create` for a job or service container
pub fn create_args(
    spec: &ContainerSpec,
    name: &str,
    network: &str,
    network_alias: Option<&str>,
    label: &str,
) -> Result<Vec<String>> {
    let image = spec.image()?;
    parse_port_mappings(&spec.port_mappings)?;

    let mut args = vec![
        "create".to_string(),
        format!("--label={}", label),
        format!("--network={}", network),
    ];
    if let Some(alias) = network_alias {
        args.push(format!("--network-alias={}", alias));
    }
    args.push("--name".to_string());
    args.push(name.to_string());
    for mapping in &spec.port_mappings {
        args.push("-p".to_string());
        args.push(mapping.clone());
    }
    args.extend(spec.create_option_args());
    args.extend(env_args(&spec.effective_env()));
    args.extend(mount_args(spec));
    args.extend(entrypoint_and_image(spec, image));
    Ok(args)
}

/// Creates a container and returns its id
pub async fn create(
    runner: &dyn CommandRunner,
    spec: &ContainerSpec,
    name: &str,
    network: &str,
    network_alias: Option<&str>,
    label: &str,
) -> Result<String> {
    let args = create_args(spec, name, network, network_alias, label)?;
    let opts = RunOptions::with_env(spec.effective_env());
    let id = run_docker(runner, &args, &opts).await?.trim().to_string();
    if id.is_empty() {
        return Err(HookError::backend(
            display_command(&args[..1]),
            "could not read id from docker command",
        ));
    }
    info!("Created container {} ({})", name, id);
    Ok(id)
}

pub async fn start(runner: &dyn CommandRunner, id: &str) -> Result<()> {
    run_docker(runner, &to_args(&["start", id]), &RunOptions::default()).await?;
    Ok(())
}

/// Force-removes a container; one that no longer exists counts as removed
pub async fn remove(runner: &dyn CommandRunner, id: &str) -> Result<()> {
    let args = to_args(&["rm", "--force", id]);
    match run_docker(runner, &args, &RunOptions::default()).await {
        Ok(_) => Ok(()),
        Err(HookError::BackendCommand { message, .. }) if is_missing(&message) => {
            debug!("Container {} already removed", id);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Force-removes every container carrying the runner label
pub async fn prune(runner: &dyn CommandRunner, label: &str) -> Result<()> {
    let filter = label_filter(label);
    let args = to_args(&["ps", "--all", "--quiet", "--no-trunc", "--filter", &filter]);
    let listing = run_docker(runner, &args, &RunOptions::default()).await?;

    let ids: Vec<String> = listing
        .lines()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Ok(());
    }

    info!("Pruning {} container(s)", ids.len());
    let mut args = to_args(&["rm", "--force"]);
    args.extend(ids);
    run_docker(runner, &args, &RunOptions::default()).await?;
    Ok(())
}

/// Lines of `docker port <id>`
pub async fn ports(runner: &dyn CommandRunner, id: &str) -> Result<Vec<String>> {
    let output = run_docker(runner, &to_args(&["port", id]), &RunOptions::default()).await?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub async fn health(runner: &dyn CommandRunner, id: &str) -> Result<ContainerHealth> {
    let args = to_args(&["inspect", HEALTH_FORMAT, id]);
    let output = run_docker(runner, &args, &RunOptions::default()).await?;
    Ok(ContainerHealth::parse(&output))
}

/// Waits until a container's health check reports `healthy`
///
/// Containers without a health check are healthy right away.
pub async fn wait_healthy(runner: &dyn CommandRunner, container: &StartedContainer) -> Result<()> {
    let mut first = true;
    let backoff = Backoff::new().max_attempts(HEALTH_ATTEMPTS);
    let what = format!("health check of '{}'", container.image);

    poll_until(backoff, &what, || {
        let check_none = std::mem::take(&mut first);
        async move {
            match health(runner, &container.id).await? {
                ContainerHealth::None if check_none => {
                    info!(
                        "Healthcheck is not set for container {}, considered as healthy",
                        container.image
                    );
                    Ok(Step::Done(()))
                }
                ContainerHealth::Healthy => Ok(Step::Done(())),
                ContainerHealth::Starting => {
                    info!("Container '{}' is 'starting'", container.image);
                    Ok(Step::Retry)
                }
                status => Err(HookError::Unhealthy {
                    container: container.image.clone(),
                    status: status.to_string(),
                }),
            }
        }
    })
    .await
}

/// Reads one variable from the configured environment of a container or image
pub async fn env_value(runner: &dyn CommandRunner, id: &str, name: &str) -> Result<String> {
    let format = format!(
        r#"--format={{{{range $index, $value := .Config.Env}}}}{{{{if eq (index (split $value "=") 0) "{}"}}}}{{{{index (split $value "=") 1}}}}{{{{end}}}}{{{{end}}}}"#,
        name
    );
    let args = to_args(&["inspect", &format, id]);
    let output = run_docker(runner, &args, &RunOptions::default()).await?;
    Ok(output
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('\'')
        .to_string())
}

/// Whether the container runs Alpine; any probe failure means no
pub async fn is_alpine(runner: &dyn CommandRunner, id: &str) -> bool {
    let args = to_args(&["exec", id, "sh", "-c", ALPINE_PROBE]);
    match runner.output(&args, &RunOptions::default()).await {
        Ok(output) => output.success(),
        Err(e) => {
            debug!("Alpine probe failed: {}", e);
            false
        }
    }
}

/// `prepend` entries ahead of `current`, `:`-joined
pub fn prefixed_path(prepend: &[String], current: &str) -> String {
    let mut parts: Vec<&str> = prepend.iter().map(String::as_str).collect();
    if !current.is_empty() {
        parts.push(current);
    }
    parts.join(":")
}

/// Runs a script step in the job container, streaming its output
pub async fn exec_step(
    runner: &dyn CommandRunner,
    id: &str,
    args: &RunScriptStepArgs,
) -> Result<()> {
    let mut docker_args = vec![
        "exec".to_string(),
        "-i".to_string(),
        format!("--workdir={}", args.working_directory),
    ];
    docker_args.extend(env_args(&args.environment_variables));

    if !args.prepend_path.is_empty() {
        let current = env_value(runner, id, "PATH").await?;
        docker_args.push("-e".to_string());
        docker_args.push(format!("PATH={}", prefixed_path(&args.prepend_path, &current)));
    }

    docker_args.push(id.to_string());
    docker_args.push(args.entry_point.clone());
    docker_args.extend(args.entry_point_args.iter().cloned());

    let opts = RunOptions::with_env(args.environment_variables.clone());
    let exit_code = runner.stream(&docker_args, &opts).await?;
    if exit_code != 0 {
        return Err(HookError::backend(
            display_command(&docker_args[..1]),
            format!("step exited with code {}", exit_code),
        ));
    }
    Ok(())
}

/// Arguments of `docker run` for a container step
pub fn run_args(
    spec: &ContainerSpec,
    image: &str,
    name: &str,
    network: Option<&str>,
    label: &str,
    path: Option<&str>,
) -> Vec<String> {
    let mut args = to_args(&["run", "--rm", "--name", name]);
    if let Some(workdir) = spec.working_directory.as_deref() {
        args.push(format!("--workdir={}", workdir));
    }
    args.push(format!("--label={}", label));
    if let Some(network) = network {
        args.push(format!("--network={}", network));
    }
    args.extend(spec.create_option_args());
    args.extend(env_args(&spec.effective_env()));
    if let Some(path) = path {
        args.push("-e".to_string());
        args.push(format!("PATH={}", path));
    }
    args.extend(mount_args(spec));
    args.extend(entrypoint_and_image(spec, image));
    args
}

/// Runs a container step to completion and returns its exit code
///
/// `prepend_path` entries are put ahead of the image's own `PATH`.
pub async fn run(
    runner: &dyn CommandRunner,
    spec: &ContainerSpec,
    image: &str,
    name: &str,
    network: Option<&str>,
    label: &str,
    prepend_path: &[String],
) -> Result<i32> {
    let path = match prepend_path {
        [] => None,
        entries => {
            let current = env_value(runner, image, "PATH").await?;
            Some(prefixed_path(entries, &current))
        }
    };
    let args = run_args(spec, image, name, network, label, path.as_deref());
    let opts = RunOptions::with_env(spec.effective_env());
    let exit_code = runner.stream(&args, &opts).await?;
    info!("Container step {} exited with code {}", name, exit_code);
    Ok(exit_code)
}
