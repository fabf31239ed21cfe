//! Docker command invocation
//!
//! Every engine call goes through [`CommandRunner`], so backends can be
//! exercised against a scripted engine in tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use berth_core::error::{HookError, Result};

/// Extra process settings for one docker invocation
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Variables added to the docker process environment
    ///
    /// Paired with `-e KEY` arguments so values never show up on the argv.
    pub env: BTreeMap<String, String>,
    /// Written to the process stdin, then stdin is closed
    pub stdin: Option<String>,
    /// Working directory of the docker process
    pub cwd: Option<PathBuf>,
}

impl RunOptions {
    pub fn with_env(env: BTreeMap<String, String>) -> Self {
        Self {
            env,
            ..Default::default()
        }
    }

    pub fn with_stdin(stdin: impl Into<String>) -> Self {
        Self {
            stdin: Some(stdin.into()),
            ..Default::default()
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command execution facility for the docker CLI
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `docker <args>` and captures its output
    async fn output(&self, args: &[String], opts: &RunOptions) -> Result<CommandOutput>;

    /// Runs `docker <args>` with inherited stdout/stderr and returns the exit code
    async fn stream(&self, args: &[String], opts: &RunOptions) -> Result<i32>;
}

/// Runs the `docker` binary found on `PATH`
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    fn command(&self, args: &[String], opts: &RunOptions) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args).envs(&opts.env).kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for DockerCli {
    async fn output(&self, args: &[String], opts: &RunOptions) -> Result<CommandOutput> {
        let mut command = self.command(args, opts);
        command
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            HookError::backend(
                display_command(args),
                format!("failed to execute {}: {}", self.program, e),
            )
        })?;

        if let Some(input) = &opts.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // Always log stdout/stderr as debug
        let verb = args.first().map(String::as_str).unwrap_or_default();
        if !stdout.trim().is_empty() {
            debug!("docker {} stdout: {}", verb, stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("docker {} stderr: {}", verb, stderr.trim());
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn stream(&self, args: &[String], opts: &RunOptions) -> Result<i32> {
        let status = self
            .command(args, opts)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| {
                HookError::backend(
                    display_command(args),
                    format!("failed to execute {}: {}", self.program, e),
                )
            })?;

        Ok(status.code().unwrap_or(-1))
    }
}

/// Runs a docker command and returns its stdout, failing on a non-zero exit
pub async fn run_docker(
    runner: &dyn CommandRunner,
    args: &[String],
    opts: &RunOptions,
) -> Result<String> {
    let output = runner.output(args, opts).await?;
    if !output.success() {
        error!("Docker failed with exit code {}", output.exit_code);
        return Err(HookError::backend(
            display_command(args),
            output.stderr.trim().to_string(),
        ));
    }
    Ok(output.stdout)
}

/// Human readable form of a docker invocation, for errors and logs
pub fn display_command(args: &[String]) -> String {
    format!("docker {}", args.join(" "))
}

/// Builds an owned argument vector from string slices
pub fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}
