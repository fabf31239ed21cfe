//! Local container-engine backend

use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

use berth_core::backend::Backend;
use berth_core::config::Config;
use berth_core::domain::container::ContainerSpec;
use berth_core::domain::context::{ContainerContext, PrepareJobResponse, ResponseContext};
use berth_core::domain::state::{DockerState, JobState};
use berth_core::dto::args::{PrepareJobArgs, RunContainerStepArgs, RunScriptStepArgs};
use berth_core::error::{HookError, Result};
use berth_core::ports::context_ports_from_listing;

use crate::command::{CommandRunner, DockerCli};
use crate::container::{self, StartedContainer};
use crate::{image, naming, network};

/// Drives a Docker-compatible engine through its CLI
pub struct DockerBackend {
    runner: Arc<dyn CommandRunner>,
    config: Config,
    label: String,
}

impl DockerBackend {
    /// Creates a backend using the `docker` binary on `PATH`
    pub fn new(config: Config) -> Self {
        Self::with_runner(config, Arc::new(DockerCli::new()))
    }

    pub fn with_runner(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        let label = naming::runner_label(&config.runner_name);
        Self {
            runner,
            config,
            label,
        }
    }

    /// Label carried by every resource of this runner
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Removes every container and network carrying the runner label
    async fn prune(&self) -> Result<()> {
        container::prune(self.runner.as_ref(), &self.label).await?;
        network::prune(self.runner.as_ref(), &self.label).await
    }

    /// Pulls, creates and starts one container
    async fn start_container(
        &self,
        spec: &ContainerSpec,
        network_alias: Option<&str>,
        network: &str,
    ) -> Result<StartedContainer> {
        let runner = self.runner.as_ref();
        let image = spec.image()?;

        image::pull_with_registry(runner, &self.config.temp_dir, image, spec.registry.as_ref())
            .await?;

        let name = naming::container_name(image);
        let id = container::create(runner, spec, &name, network, network_alias, &self.label).await?;
        container::start(runner, &id).await?;

        Ok(StartedContainer {
            id,
            image: image.to_string(),
        })
    }

    async fn context_for(&self, started: &StartedContainer, network: &str) -> Result<ContainerContext> {
        let listing = container::ports(self.runner.as_ref(), &started.id).await?;
        Ok(ContainerContext {
            id: Some(started.id.clone()),
            image: started.image.clone(),
            network: Some(network.to_string()),
            ports: context_ports_from_listing(&listing)?,
        })
    }

    async fn provision(&self, args: &PrepareJobArgs) -> Result<PrepareJobResponse> {
        let runner = self.runner.as_ref();

        let (network, network_owned) = match &self.config.network {
            Some(name) => (name.clone(), false),
            None => {
                let name = naming::network_name();
                network::create(runner, &name, &self.label).await?;
                (name, true)
            }
        };

        let job = match args.job_container() {
            Some(spec) => Some(self.start_container(&with_default_entrypoint(spec), None, &network).await?),
            None => {
                info!("No job container provided, skipping");
                None
            }
        };

        let mut services = Vec::with_capacity(args.services.len());
        for service in &args.services {
            let started = self
                .start_container(&service.container, Some(&service.context_name), &network)
                .await?;
            services.push(started);
        }

        let is_alpine = match &job {
            Some(job) => container::is_alpine(runner, &job.id).await,
            None => false,
        };

        let job_context = match &job {
            Some(job) => Some(self.context_for(job, &network).await?),
            None => None,
        };
        let mut service_contexts = Vec::with_capacity(services.len());
        for service in &services {
            service_contexts.push(self.context_for(service, &network).await?);
        }

        let checks = job
            .iter()
            .chain(services.iter())
            .map(|started| container::wait_healthy(runner, started));
        try_join_all(checks).await?;
        info!("All services are healthy");

        let state = DockerState {
            network: Some(network),
            network_owned,
            container: job.map(|j| j.id),
            services: services.into_iter().map(|s| s.id).collect(),
        };

        Ok(PrepareJobResponse {
            state: JobState::docker(state),
            context: ResponseContext {
                container: job_context,
                services: service_contexts,
            },
            is_alpine,
        })
    }
}

/// Job containers without an entrypoint idle on `tail -f /dev/null`
fn with_default_entrypoint(spec: &ContainerSpec) -> ContainerSpec {
    let mut spec = spec.clone();
    if spec.entry_point.as_deref().is_none_or(str::is_empty) {
        spec.entry_point = Some("tail".to_string());
        spec.entry_point_args = vec!["-f".to_string(), "/dev/null".to_string()];
    }
    spec
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn prepare_job(&self, args: PrepareJobArgs) -> Result<PrepareJobResponse> {
        self.prune().await?;

        if args.is_empty() {
            info!("No containers exist, skipping hook invocation");
            return Ok(PrepareJobResponse {
                state: JobState::docker(DockerState::default()),
                context: ResponseContext::default(),
                is_alpine: false,
            });
        }

        match self.provision(&args).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Failed to initialize containers, {}", e);
                if let Err(prune_err) = self.prune().await {
                    warn!("Failed to prune after failed prepare: {}", prune_err);
                }
                Err(e)
            }
        }
    }

    async fn run_script_step(&self, args: RunScriptStepArgs, state: &JobState) -> Result<()> {
        let id = state.as_docker()?.container.as_deref().ok_or_else(|| {
            HookError::StateMismatch("job state does not reference a job container".to_string())
        })?;
        container::exec_step(self.runner.as_ref(), id, &args).await
    }

    async fn run_container_step(
        &self,
        args: RunContainerStepArgs,
        state: Option<&JobState>,
    ) -> Result<i32> {
        let runner = self.runner.as_ref();
        let network = match state {
            Some(state) => state.as_docker()?.network.clone(),
            None => None,
        };

        let tag = naming::build_tag(&self.label);
        let image = match args.dockerfile.as_deref().filter(|d| !d.is_empty()) {
            Some(dockerfile) => {
                image::build(runner, dockerfile, &tag, &self.config.workspace).await?;
                tag
            }
            None => {
                let image = args.container.image()?;
                image::pull_with_registry(
                    runner,
                    &self.config.temp_dir,
                    image,
                    args.container.registry.as_ref(),
                )
                .await?;
                image.to_string()
            }
        };

        // Labelled, so a step container that outlives `--rm` is pruned at cleanup
        let name = naming::container_name(&image);
        container::run(
            runner,
            &args.container,
            &image,
            &name,
            network.as_deref(),
            &self.label,
            &args.prepend_path,
        )
        .await
    }

    async fn cleanup_job(&self, state: Option<&JobState>) -> Result<()> {
        let runner = self.runner.as_ref();
        let mut failures = Vec::new();

        if let Some(state) = state {
            let state = state.as_docker()?;
            for id in state.container.iter().chain(state.services.iter()) {
                if let Err(e) = container::remove(runner, id).await {
                    warn!("Failed to remove container {}: {}", id, e);
                    failures.push(format!("container {}: {}", id, e));
                }
            }
            if let (true, Some(name)) = (state.network_owned, state.network.as_deref()) {
                if let Err(e) = network::remove(runner, name).await {
                    warn!("Failed to remove network {}: {}", name, e);
                    failures.push(format!("network {}: {}", name, e));
                }
            }
        }

        if let Err(e) = container::prune(runner, &self.label).await {
            warn!("Failed to prune containers: {}", e);
            failures.push(format!("labelled containers: {}", e));
        }
        if let Err(e) = network::prune(runner, &self.label).await {
            warn!("Failed to prune networks: {}", e);
            failures.push(format!("labelled networks: {}", e));
        }

        if failures.is_empty() {
            info!("Cleanup complete");
            Ok(())
        } else {
            Err(HookError::Cleanup(failures))
        }
    }
}
