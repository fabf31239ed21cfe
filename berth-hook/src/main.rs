//! Berth Hook
//!
//! Entry point invoked by the CI runner for every container lifecycle event.
//!
//! The runner writes one JSON payload (`command`, `args`, `state`,
//! `responseFile`) to stdin. The hook loads its configuration from the
//! environment, builds the selected backend and dispatches the command.
//! Standard output belongs to the step, so logs go to standard error.

mod dispatch;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use berth_core::backend::Backend;
use berth_core::config::{BACKEND_ENV, BackendKind, Config};
use berth_core::dto::hook::HookInput;
use berth_docker::DockerBackend;
use berth_k8s::KubernetesBackend;

use crate::dispatch::dispatch;

#[derive(Parser)]
#[command(name = "berth-hook")]
#[command(about = "Container lifecycle hook for CI runners", long_about = None)]
struct Cli {
    /// Backend driving the job's containers
    #[arg(long, env = BACKEND_ENV, default_value = "docker")]
    backend: BackendKind,

    /// Read the hook payload from this file instead of stdin
    #[arg(long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "berth_hook=info,berth_core=info,berth_docker=info,berth_k8s=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let raw = read_input(cli.input.as_deref()).await?;
    let input = HookInput::from_json(&raw).context("Failed to parse hook input")?;
    info!("Running {} with the {} backend", input.command, cli.backend);

    let config = Config::from_env(cli.backend)?;
    config.validate()?;

    let backend = build_backend(config).await?;
    dispatch(backend.as_ref(), &input).await
}

async fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read hook input from {}", path.display())),
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("Failed to read hook input from stdin")?;
            Ok(raw)
        }
    }
}

async fn build_backend(config: Config) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match config.backend {
        BackendKind::Docker => Box::new(DockerBackend::new(config)),
        BackendKind::Kubernetes => Box::new(
            KubernetesBackend::connect(config)
                .await
                .context("Failed to initialize the kubernetes backend")?,
        ),
    };
    info!("Using the {} backend", backend.name());
    Ok(backend)
}
