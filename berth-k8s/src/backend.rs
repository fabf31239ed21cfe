//! Cluster-scheduler backend

use async_trait::async_trait;
use futures::future::try_join_all;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use berth_core::backend::Backend;
use berth_core::config::Config;
use berth_core::domain::container::{ALPINE_PROBE, ContainerSpec, Registry};
use berth_core::domain::context::{ContainerContext, PrepareJobResponse, ResponseContext};
use berth_core::domain::health::PodPhase;
use berth_core::domain::state::{JobState, KubernetesState};
use berth_core::dto::args::{PrepareJobArgs, RunContainerStepArgs, RunScriptStepArgs};
use berth_core::error::{HookError, Result};
use berth_core::ports::context_ports_from_declared;

use crate::client::{ClusterClient, ExecIo, KubeClient};
use crate::copy::copy_to_pod;
use crate::manifest::{self, BuiltContainer, ContainerRole, CopyTarget, WORK_MOUNT_PATH};
use crate::names::{self, JOB_CONTAINER_NAME};
use crate::permissions::{self, POD_PERMISSIONS, SECRET_PERMISSIONS};
use crate::script::{self, shell_quote};
use crate::template::PodTemplate;
use crate::wait;

/// Drives jobs as pods through the cluster API
pub struct KubernetesBackend {
    client: Arc<dyn ClusterClient>,
    config: Config,
    template: Option<PodTemplate>,
}

impl KubernetesBackend {
    /// Connects with the ambient cluster credentials
    pub async fn connect(config: Config) -> Result<Self> {
        let client = KubeClient::connect(config.namespace.clone()).await?;
        Self::with_client(config, Arc::new(client))
    }

    pub fn with_client(config: Config, client: Arc<dyn ClusterClient>) -> Result<Self> {
        let template = config
            .pod_template_path
            .as_deref()
            .map(PodTemplate::load)
            .transpose()?;
        Ok(Self {
            client,
            config,
            template,
        })
    }

    fn runner_pod(&self) -> &str {
        &self.config.runner_name
    }

    /// Deletes every pod, job and secret labelled for this runner
    ///
    /// Deletion continues past individual failures; they are reported together.
    async fn prune(&self) -> Result<()> {
        let client = self.client.as_ref();
        let selector = names::runner_selector(self.runner_pod());
        let mut failures = Vec::new();

        match client.list_pods(&selector).await {
            Ok(pods) => {
                for name in pods.into_iter().filter_map(|p| p.metadata.name) {
                    if let Err(e) = client.delete_pod(&name).await {
                        warn!("Failed to delete pod {}: {}", name, e);
                        failures.push(format!("pod {}: {}", name, e));
                    }
                }
            }
            Err(e) => failures.push(format!("labelled pods: {}", e)),
        }

        match client.list_jobs(&selector).await {
            Ok(jobs) => {
                for name in jobs.into_iter().filter_map(|j| j.metadata.name) {
                    if let Err(e) = client.delete_job(&name).await {
                        warn!("Failed to delete job {}: {}", name, e);
                        failures.push(format!("job {}: {}", name, e));
                    }
                }
            }
            Err(e) => failures.push(format!("labelled jobs: {}", e)),
        }

        match client.list_secrets(&selector).await {
            Ok(secrets) => {
                for name in secrets.into_iter().filter_map(|s| s.metadata.name) {
                    if let Err(e) = client.delete_secret(&name).await {
                        warn!("Failed to delete secret {}: {}", name, e);
                        failures.push(format!("secret {}: {}", name, e));
                    }
                }
            }
            Err(e) => failures.push(format!("labelled secrets: {}", e)),
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HookError::Cleanup(failures))
        }
    }

    async fn create_pull_secret(&self, registry: &Registry) -> Result<String> {
        let name = names::secret_name(self.runner_pod());
        let secret = manifest::registry_secret(&self.config, &name, registry);
        self.client.create_secret(&secret).await?;
        info!("Created image pull secret {} for {}", name, registry.server_url);
        Ok(name)
    }

    /// Node of the runner pod, so the job shares its work volume
    async fn runner_node(&self) -> Result<Option<String>> {
        match self.client.get_pod(self.runner_pod()).await? {
            Some(pod) => Ok(pod.spec.and_then(|s| s.node_name)),
            None => {
                warn!(
                    "Runner pod {} not found, the job pod will not be pinned to its node",
                    self.runner_pod()
                );
                Ok(None)
            }
        }
    }

    /// Runs a setup command in the job container, failing on a non-success status
    async fn exec_checked(&self, pod: &str, command: Vec<String>) -> Result<()> {
        let display = command.join(" ");
        let output = self
            .client
            .exec(pod, JOB_CONTAINER_NAME, command, ExecIo::captured())
            .await?;
        if !output.success {
            return Err(HookError::backend(
                format!("exec `{}` in {}", display, pod),
                output.describe(),
            ));
        }
        Ok(())
    }

    async fn is_alpine(&self, pod: &str) -> Result<bool> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            ALPINE_PROBE.to_string(),
        ];
        let output = self
            .client
            .exec(pod, JOB_CONTAINER_NAME, command, ExecIo::captured())
            .await
            .map_err(|e| {
                HookError::backend(
                    format!("alpine probe in {}", pod),
                    format!("Failed to determine if the pod is alpine: {}", e),
                )
            })?;
        Ok(output.success)
    }

    /// Copies the workspace, the runner externals and outside mounts into the pod
    async fn populate(&self, pod: &str, copies: &[CopyTarget]) -> Result<()> {
        let work_root = self.config.work_root();
        let workspace_target = in_work_volume(&work_root, &self.config.workspace);
        let externals = work_root
            .parent()
            .map(|p| p.join("externals"))
            .filter(|p| p.is_dir());
        let externals_target = format!("{}/externals", WORK_MOUNT_PATH);

        let mut targets = vec![workspace_target.clone()];
        if externals.is_some() {
            targets.push(externals_target.clone());
        }
        targets.extend(copies.iter().map(|c| c.target.clone()));

        let script = format!(
            "mkdir -p {}",
            targets
                .iter()
                .map(|t| shell_quote(t))
                .collect::<Vec<_>>()
                .join(" ")
        );
        self.exec_checked(pod, vec!["sh".to_string(), "-c".to_string(), script])
            .await?;

        let temp_dir = self.config.temp_dir.as_path();
        let client = self.client.as_ref();
        copy_to_pod(
            client,
            temp_dir,
            pod,
            JOB_CONTAINER_NAME,
            &self.config.workspace,
            &workspace_target,
        )
        .await?;
        info!("Copied workspace into {}", workspace_target);

        match externals {
            Some(dir) => {
                copy_to_pod(client, temp_dir, pod, JOB_CONTAINER_NAME, &dir, &externals_target)
                    .await?
            }
            None => debug!("No runner externals to copy"),
        }

        try_join_all(copies.iter().map(|copy| {
            copy_to_pod(
                client,
                temp_dir,
                pod,
                JOB_CONTAINER_NAME,
                &copy.source,
                &copy.target,
            )
        }))
        .await?;
        Ok(())
    }

    async fn provision(
        &self,
        args: &PrepareJobArgs,
        job: &ContainerSpec,
    ) -> Result<PrepareJobResponse> {
        let registries = distinct_registries(
            std::iter::once(job).chain(args.services.iter().map(|s| &s.container)),
        );

        permissions::ensure(self.client.as_ref(), POD_PERMISSIONS).await?;
        if !registries.is_empty() {
            permissions::ensure(self.client.as_ref(), SECRET_PERMISSIONS).await?;
        }

        let mut secrets = Vec::with_capacity(registries.len());
        for registry in &registries {
            secrets.push(self.create_pull_secret(registry).await?);
        }

        let node_name = self.runner_node().await?;

        info!("Using image '{}' for job image", job.image()?);
        let BuiltContainer {
            container: job_container,
            copies,
        } = manifest::build_container(&self.config, JOB_CONTAINER_NAME, job, ContainerRole::Job)?;

        let mut containers = vec![job_container];
        let mut service_names = Vec::with_capacity(args.services.len());
        for service in &args.services {
            let name = names::service_container_name(&service.context_name);
            info!("Adding service '{}' to pod definition", service.container.image()?);
            let built = manifest::build_container(
                &self.config,
                &name,
                &service.container,
                ContainerRole::Service,
            )?;
            containers.push(built.container);
            service_names.push(name);
        }

        let mut pod = manifest::job_pod(&self.config, containers, node_name, &secrets);
        if let Some(template) = &self.template {
            pod = template.apply_to_pod(&pod)?;
        }

        let created = self.client.create_pod(&pod).await?;
        let pod_name = created.metadata.name.clone().ok_or_else(|| {
            HookError::backend("create job pod", "created pod should have metadata.name")
        })?;
        info!("Created job pod {}", pod_name);

        wait::wait_for_pod_phases(
            self.client.as_ref(),
            &pod_name,
            &[PodPhase::Running],
            &[PodPhase::Pending],
            self.config.prepare_timeout,
        )
        .await?;
        info!("Pod is ready for traffic");

        self.populate(&pod_name, &copies).await?;
        let is_alpine = self.is_alpine(&pod_name).await?;

        let spec_containers = created
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default();
        let context_of = |name: &str| {
            spec_containers.iter().find(|c| c.name == name).map(|c| ContainerContext {
                id: None,
                image: c.image.clone().unwrap_or_default(),
                network: None,
                ports: context_ports_from_declared(manifest::declared_ports(c)),
            })
        };

        let context = ResponseContext {
            container: context_of(JOB_CONTAINER_NAME),
            services: service_names.iter().filter_map(|n| context_of(n)).collect(),
        };

        Ok(PrepareJobResponse {
            state: JobState::kubernetes(KubernetesState {
                job_pod: pod_name,
                secrets,
            }),
            context,
            is_alpine,
        })
    }
}

/// `target` as a path inside the work volume mount
fn in_work_volume(work_root: &Path, target: &Path) -> String {
    match target.strip_prefix(work_root) {
        Ok(relative) if !relative.as_os_str().is_empty() => {
            format!("{}/{}", WORK_MOUNT_PATH, relative.to_string_lossy())
        }
        _ => WORK_MOUNT_PATH.to_string(),
    }
}

/// Registries of the given containers, each server once
fn distinct_registries<'a, I>(specs: I) -> Vec<Registry>
where
    I: IntoIterator<Item = &'a ContainerSpec>,
{
    let mut registries: Vec<Registry> = Vec::new();
    for registry in specs.into_iter().filter_map(|s| s.registry.as_ref()) {
        if !registries.iter().any(|r| r.server_url == registry.server_url) {
            registries.push(registry.clone());
        }
    }
    registries
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn prepare_job(&self, args: PrepareJobArgs) -> Result<PrepareJobResponse> {
        let job = args.job_container().ok_or_else(|| {
            HookError::InvalidInput("a job container is required for this backend".to_string())
        })?;

        self.prune().await?;

        match self.provision(&args, job).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Failed to prepare the job pod, {}", e);
                if let Err(prune_err) = self.prune().await {
                    warn!("Failed to prune after failed prepare: {}", prune_err);
                }
                Err(e)
            }
        }
    }

    async fn run_script_step(&self, args: RunScriptStepArgs, state: &JobState) -> Result<()> {
        let state = state.as_kubernetes()?;
        let command = script::step_command(&args)?;

        let output = self
            .client
            .exec(
                &state.job_pod,
                JOB_CONTAINER_NAME,
                command,
                ExecIo::forwarded(),
            )
            .await?;
        if !output.success {
            return Err(HookError::backend(
                format!("run script step in {}", state.job_pod),
                output.describe(),
            ));
        }
        Ok(())
    }

    async fn run_container_step(
        &self,
        args: RunContainerStepArgs,
        state: Option<&JobState>,
    ) -> Result<i32> {
        if let Some(state) = state {
            state.as_kubernetes()?;
        }
        if args.dockerfile.as_deref().is_some_and(|d| !d.is_empty()) {
            return Err(HookError::InvalidInput(
                "Building container actions is not currently supported".to_string(),
            ));
        }

        let client = self.client.as_ref();
        let mut secrets = Vec::new();
        if let Some(registry) = &args.container.registry {
            permissions::ensure(client, SECRET_PERMISSIONS).await?;
            secrets.push(self.create_pull_secret(registry).await?);
        }

        let mut built = manifest::build_container(
            &self.config,
            JOB_CONTAINER_NAME,
            &args.container,
            ContainerRole::Step,
        )?;
        manifest::prepend_path(&mut built.container, &args.prepend_path);
        let node_name = self.runner_node().await?;

        let job_name = names::step_job_name(self.runner_pod());
        let mut job = manifest::step_job(&self.config, &job_name, built.container, node_name, &secrets);
        if let (Some(template), Some(spec)) = (&self.template, job.spec.as_mut()) {
            spec.template = template.apply_to_step(&spec.template)?;
        }

        client.create_job(&job).await?;
        info!("Created step job {}", job_name);

        let pod = wait::find_job_pod(client, &job_name).await?;
        wait::wait_for_pod_phases(
            client,
            &pod,
            &[PodPhase::Running, PodPhase::Succeeded, PodPhase::Failed],
            &[PodPhase::Pending, PodPhase::Unknown],
            self.config.prepare_timeout,
        )
        .await?;

        client.stream_logs(&pod, JOB_CONTAINER_NAME).await?;
        wait::wait_for_job(client, &job_name).await?;

        let exit_code = match client.get_pod(&pod).await? {
            Some(finished) => wait::step_exit_code(&finished),
            None => {
                warn!("Step pod {} disappeared, assuming exit code 0", pod);
                0
            }
        };
        info!("Step job {} exited with code {}", job_name, exit_code);

        if let Err(e) = client.delete_job(&job_name).await {
            warn!("Failed to delete step job {}: {}", job_name, e);
        }
        Ok(exit_code)
    }

    async fn cleanup_job(&self, state: Option<&JobState>) -> Result<()> {
        let client = self.client.as_ref();
        let mut failures = Vec::new();

        if let Some(state) = state {
            let state = state.as_kubernetes()?;
            if !state.job_pod.is_empty() {
                if let Err(e) = client.delete_pod(&state.job_pod).await {
                    warn!("Failed to delete pod {}: {}", state.job_pod, e);
                    failures.push(format!("pod {}: {}", state.job_pod, e));
                }
            }
            for secret in &state.secrets {
                if let Err(e) = client.delete_secret(secret).await {
                    warn!("Failed to delete secret {}: {}", secret, e);
                    failures.push(format!("secret {}: {}", secret, e));
                }
            }
        }

        if let Err(e) = self.prune().await {
            match e {
                HookError::Cleanup(pruned) => failures.extend(pruned),
                other => failures.push(other.to_string()),
            }
        }

        if failures.is_empty() {
            info!("Cleanup complete");
            Ok(())
        } else {
            Err(HookError::Cleanup(failures))
        }
    }
}
