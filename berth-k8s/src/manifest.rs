//! Pod, job and secret manifests
//!
//! Everything here is pure: the backend decides when to submit the objects.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::ByteString;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, LocalObjectReference, PersistentVolumeClaimVolumeSource,
    Pod, PodSpec, PodTemplateSpec, ResourceRequirements, Secret, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use berth_core::config::Config;
use berth_core::domain::container::{ContainerSpec, Mount, Registry};
use berth_core::error::{HookError, Result};
use berth_core::ports::parse_port_mappings;

use crate::names::{self, WORK_VOLUME_NAME};

/// Command of a job container that did not ask for one
pub const DEFAULT_ENTRY_POINT: &str = "tail";
pub const DEFAULT_ENTRY_POINT_ARGS: [&str; 2] = ["-f", "/dev/null"];

/// Seconds a finished step job is kept before the cluster collects it
pub const STEP_JOB_TTL_SECONDS: i32 = 300;

/// Registry assumed when a credential names no server
pub const DEFAULT_REGISTRY: &str = "https://index.docker.io/v1/";

pub const WORK_MOUNT_PATH: &str = "/__w";

/// Environment variables never forwarded to pod containers
const SKIPPED_ENV: &[&str] = &["HOME"];

/// `PATH` assumed for a step image; the API server cannot read the image's own
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Which role a container plays, deciding its fixed mounts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    Job,
    Service,
    Step,
}

/// A mount whose source lives outside the work volume
///
/// It cannot be expressed as a `subPath`, so the backend copies the source
/// into the running pod instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    pub source: PathBuf,
    pub target: String,
}

/// A container definition plus the copies it needs after start
#[derive(Debug, Clone)]
pub struct BuiltContainer {
    pub container: Container,
    pub copies: Vec<CopyTarget>,
}

fn work_mount(mount_path: &str, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        name: WORK_VOLUME_NAME.to_string(),
        mount_path: mount_path.to_string(),
        sub_path: sub_path.map(str::to_string),
        ..VolumeMount::default()
    }
}

/// Volume mounts of a container together with the out-of-volume copies
pub fn container_volumes(
    config: &Config,
    role: ContainerRole,
    user_mounts: &[Mount],
) -> (Vec<VolumeMount>, Vec<CopyTarget>) {
    let mut mounts = vec![work_mount(WORK_MOUNT_PATH, None)];
    if role == ContainerRole::Service {
        return (mounts, Vec::new());
    }

    mounts.push(work_mount("/__e", Some("externals")));
    mounts.push(work_mount("/github/home", Some("_temp/_github_home")));
    mounts.push(work_mount("/github/workflow", Some("_temp/_github_workflow")));

    let work_root = config.work_root();
    if role == ContainerRole::Step {
        let workspace = config
            .workspace
            .strip_prefix(&work_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| config.workspace.clone());
        mounts.push(work_mount(
            "/github/workspace",
            Some(&workspace.to_string_lossy()),
        ));
        mounts.push(work_mount(
            "/github/file_commands",
            Some("_temp/_runner_file_commands"),
        ));
    }

    let mut copies = Vec::new();
    for mount in user_mounts {
        let source = Path::new(&mount.source_volume_path);
        let sub_path = if source.is_absolute() {
            match source.strip_prefix(&work_root) {
                Ok(relative) => relative.to_string_lossy().to_string(),
                Err(_) => {
                    copies.push(CopyTarget {
                        source: source.to_path_buf(),
                        target: mount.target_volume_path.clone(),
                    });
                    continue;
                }
            }
        } else {
            mount.source_volume_path.clone()
        };

        mounts.push(VolumeMount {
            name: WORK_VOLUME_NAME.to_string(),
            mount_path: mount.target_volume_path.clone(),
            sub_path: (!sub_path.is_empty()).then_some(sub_path),
            read_only: mount.read_only.then_some(true),
            ..VolumeMount::default()
        });
    }

    (mounts, copies)
}

/// Parses `--name value` / `--name=value` pairs
fn parse_options(options: &str) -> Result<Vec<(String, String)>> {
    let bad = |detail: String| {
        HookError::InvalidInput(format!(
            "create options '{}' are malformed: {}",
            options, detail
        ))
    };

    let mut parsed = Vec::new();
    let mut words = options.split_whitespace();
    while let Some(word) = words.next() {
        if !word.starts_with('-') {
            return Err(bad(format!("expected an option, found '{}'", word)));
        }
        let pair = match word.split('=').collect::<Vec<_>>().as_slice() {
            [name] => {
                let value = words
                    .next()
                    .ok_or_else(|| bad(format!("option {} must have a value", name)))?;
                (name.to_string(), value.to_string())
            }
            [name, value] => (name.to_string(), value.to_string()),
            _ => return Err(bad(format!("cannot parse '{}'", word))),
        };
        parsed.push(pair);
    }
    Ok(parsed)
}

/// Translates the supported create options into resource requirements
pub fn resource_requirements(options: &str) -> Result<Option<ResourceRequirements>> {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();

    for (name, value) in parse_options(options)? {
        match name.as_str() {
            "--cpus" => {
                requests.insert("cpu".to_string(), Quantity(value));
            }
            "--memory" | "-m" => {
                limits.insert("memory".to_string(), Quantity(value));
            }
            other => warn!(
                "Container option {} is not supported. Supported options are ['--cpus', '--memory', '-m']",
                other
            ),
        }
    }

    if requests.is_empty() && limits.is_empty() {
        return Ok(None);
    }
    Ok(Some(ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..ResourceRequirements::default()
    }))
}

fn env_vars(spec: &ContainerSpec) -> Vec<EnvVar> {
    spec.effective_env()
        .into_iter()
        .filter(|(key, value)| !value.is_empty() && !SKIPPED_ENV.contains(&key.as_str()))
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..EnvVar::default()
        })
        .collect()
}

fn container_ports(spec: &ContainerSpec) -> Result<Option<Vec<ContainerPort>>> {
    let bindings = parse_port_mappings(&spec.port_mappings)?;
    if bindings.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        bindings
            .into_iter()
            .map(|binding| ContainerPort {
                container_port: i32::from(binding.container_port),
                host_port: binding.host_port.map(i32::from),
                protocol: Some(binding.protocol.as_k8s().to_string()),
                ..ContainerPort::default()
            })
            .collect(),
    ))
}

/// Builds one pod container from a requested container
pub fn build_container(
    config: &Config,
    name: &str,
    spec: &ContainerSpec,
    role: ContainerRole,
) -> Result<BuiltContainer> {
    let image = spec.image()?.to_string();

    let (command, args) = match (spec.entry_point.as_deref(), role) {
        (Some(entry), _) if !entry.is_empty() => (
            Some(vec![entry.to_string()]),
            Some(spec.entry_point_args.clone()).filter(|a| !a.is_empty()),
        ),
        (_, ContainerRole::Job) => (
            Some(vec![DEFAULT_ENTRY_POINT.to_string()]),
            Some(DEFAULT_ENTRY_POINT_ARGS.map(str::to_string).to_vec()),
        ),
        _ => (None, Some(spec.entry_point_args.clone()).filter(|a| !a.is_empty())),
    };

    let resources = match spec.create_options.as_deref() {
        Some(options) if !options.trim().is_empty() => resource_requirements(options)?,
        _ => None,
    };

    let (volume_mounts, copies) = container_volumes(config, role, &spec.user_mount_volumes);

    let container = Container {
        name: name.to_string(),
        image: Some(image),
        command,
        args,
        working_dir: spec.working_directory.clone().filter(|w| !w.is_empty()),
        env: Some(env_vars(spec)),
        ports: container_ports(spec)?,
        resources,
        volume_mounts: Some(volume_mounts),
        ..Container::default()
    };
    Ok(BuiltContainer { container, copies })
}

/// Puts `prepend` ahead of the container's `PATH`
///
/// A `PATH` from the step's own environment is the base, [`DEFAULT_PATH`]
/// otherwise.
pub fn prepend_path(container: &mut Container, prepend: &[String]) {
    if prepend.is_empty() {
        return;
    }
    let env = container.env.get_or_insert_with(Vec::new);
    let current = env
        .iter()
        .position(|var| var.name == "PATH")
        .map(|i| env.remove(i))
        .and_then(|var| var.value)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_PATH.to_string());

    let mut parts = prepend.to_vec();
    parts.push(current);
    env.push(EnvVar {
        name: "PATH".to_string(),
        value: Some(parts.join(":")),
        ..EnvVar::default()
    });
}

/// The job pod: job container, services and the work volume
pub fn job_pod(
    config: &Config,
    containers: Vec<Container>,
    node_name: Option<String>,
    pull_secrets: &[String],
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(names::job_pod_name(&config.runner_name)),
            labels: Some(names::runner_labels(&config.runner_name)),
            ..ObjectMeta::default()
        },
        spec: Some(pod_spec(config, containers, node_name, pull_secrets)),
        ..Pod::default()
    }
}

fn pod_spec(
    config: &Config,
    containers: Vec<Container>,
    node_name: Option<String>,
    pull_secrets: &[String],
) -> PodSpec {
    PodSpec {
        containers,
        restart_policy: Some("Never".to_string()),
        node_name,
        volumes: Some(vec![Volume {
            name: WORK_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: names::claim_name(config),
                ..PersistentVolumeClaimVolumeSource::default()
            }),
            ..Volume::default()
        }]),
        image_pull_secrets: (!pull_secrets.is_empty()).then(|| {
            pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect()
        }),
        ..PodSpec::default()
    }
}

/// A one-off job running a container step
pub fn step_job(
    config: &Config,
    name: &str,
    container: Container,
    node_name: Option<String>,
    pull_secrets: &[String],
) -> Job {
    let labels = names::runner_labels(&config.runner_name);
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(STEP_JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(pod_spec(config, vec![container], node_name, pull_secrets)),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

/// `kubernetes.io/dockerconfigjson` secret holding one registry credential
pub fn registry_secret(config: &Config, name: &str, registry: &Registry) -> Secret {
    let server = if registry.server_url.is_empty() {
        DEFAULT_REGISTRY
    } else {
        registry.server_url.as_str()
    };

    let mut entry = serde_json::Map::new();
    if let Some((user, password)) = registry.credentials() {
        entry.insert("username".to_string(), json!(user));
        entry.insert("password".to_string(), json!(password));
        entry.insert(
            "auth".to_string(),
            json!(STANDARD.encode(format!("{}:{}", user, password))),
        );
    }
    let docker_config = json!({ "auths": { server: entry } });

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(names::runner_labels(&config.runner_name)),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(docker_config.to_string().into_bytes()),
        )])),
        ..Secret::default()
    }
}

/// `(containerPort, hostPort)` pairs declared by a container
pub fn declared_ports(container: &Container) -> Vec<(Option<i32>, Option<i32>)> {
    container
        .ports
        .iter()
        .flatten()
        .map(|port| (Some(port.container_port), port.host_port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> Config {
        let mut config = Config::default();
        config.runner_name = "runner-abc".to_string();
        config
    }

    fn mount_paths(mounts: &[VolumeMount]) -> Vec<(&str, Option<&str>)> {
        mounts
            .iter()
            .map(|m| (m.mount_path.as_str(), m.sub_path.as_deref()))
            .collect()
    }

    #[test]
    fn test_job_container_defaults_to_tail() {
        let spec = ContainerSpec {
            image: Some("node:20".to_string()),
            ..Default::default()
        };
        let built = build_container(&config(), "job", &spec, ContainerRole::Job).unwrap();
        assert_eq!(built.container.command, Some(vec!["tail".to_string()]));
        assert_eq!(
            built.container.args,
            Some(vec!["-f".to_string(), "/dev/null".to_string()])
        );
    }

    #[test]
    fn test_service_keeps_image_entrypoint() {
        let spec = ContainerSpec {
            image: Some("redis".to_string()),
            ..Default::default()
        };
        let built = build_container(&config(), "redis", &spec, ContainerRole::Service).unwrap();
        assert!(built.container.command.is_none());
        assert_eq!(
            mount_paths(built.container.volume_mounts.as_deref().unwrap()),
            vec![("/__w", None)]
        );
    }

    #[test]
    fn test_env_skips_home_and_empty_values() {
        let spec = ContainerSpec {
            image: Some("node:20".to_string()),
            environment_variables: BTreeMap::from([
                ("HOME".to_string(), "/root".to_string()),
                ("EMPTY".to_string(), String::new()),
                ("FOO".to_string(), "bar".to_string()),
            ]),
            ..Default::default()
        };
        let built = build_container(&config(), "job", &spec, ContainerRole::Job).unwrap();
        let names: Vec<String> = built
            .container
            .env
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["CI", "FOO", "GITHUB_ACTIONS"]);
    }

    #[test]
    fn test_ports_are_declared() {
        let spec = ContainerSpec {
            image: Some("nginx".to_string()),
            port_mappings: vec!["8080:80".to_string(), "53/udp".to_string()],
            ..Default::default()
        };
        let built = build_container(&config(), "nginx", &spec, ContainerRole::Service).unwrap();
        let ports = built.container.ports.unwrap();
        assert_eq!(ports[0].container_port, 80);
        assert_eq!(ports[0].host_port, Some(8080));
        assert_eq!(ports[1].protocol.as_deref(), Some("UDP"));

        let bad = ContainerSpec {
            port_mappings: vec!["eighty".to_string()],
            ..spec
        };
        assert!(matches!(
            build_container(&config(), "nginx", &bad, ContainerRole::Service),
            Err(HookError::Format { .. })
        ));
    }

    #[test]
    fn test_resource_requirements() {
        let resources = resource_requirements("--cpus 2 --memory=1Gi --privileged true")
            .unwrap()
            .unwrap();
        assert_eq!(
            resources.requests.unwrap()["cpu"],
            Quantity("2".to_string())
        );
        assert_eq!(
            resources.limits.unwrap()["memory"],
            Quantity("1Gi".to_string())
        );

        assert!(resource_requirements("--cpus").is_err());
        assert!(resource_requirements("cpus 2").is_err());
        assert!(resource_requirements("--cpus=1=2").is_err());
        assert!(resource_requirements("--network host").unwrap().is_none());
    }

    #[test]
    fn test_job_mounts_and_outside_copies() {
        let config = config();
        let mounts = vec![
            Mount {
                source_volume_path: "/home/runner/_work/repo/repo/cache".to_string(),
                target_volume_path: "/cache".to_string(),
                read_only: true,
            },
            Mount {
                source_volume_path: "/opt/tools".to_string(),
                target_volume_path: "/tools".to_string(),
                read_only: false,
            },
        ];
        let (volume_mounts, copies) = container_volumes(&config, ContainerRole::Job, &mounts);

        assert_eq!(
            mount_paths(&volume_mounts),
            vec![
                ("/__w", None),
                ("/__e", Some("externals")),
                ("/github/home", Some("_temp/_github_home")),
                ("/github/workflow", Some("_temp/_github_workflow")),
                ("/cache", Some("repo/repo/cache")),
            ]
        );
        assert_eq!(volume_mounts[4].read_only, Some(true));
        assert_eq!(
            copies,
            vec![CopyTarget {
                source: PathBuf::from("/opt/tools"),
                target: "/tools".to_string(),
            }]
        );
    }

    #[test]
    fn test_step_mounts_workspace() {
        let (volume_mounts, _) = container_volumes(&config(), ContainerRole::Step, &[]);
        let paths = mount_paths(&volume_mounts);
        assert!(paths.contains(&("/github/workspace", Some("repo/repo"))));
        assert!(paths.contains(&("/github/file_commands", Some("_temp/_runner_file_commands"))));
    }

    #[test]
    fn test_job_pod_wiring() {
        let config = config();
        let pod = job_pod(
            &config,
            vec![Container {
                name: "job".to_string(),
                ..Container::default()
            }],
            Some("node-1".to_string()),
            &["runner-abc-secret-1".to_string()],
        );

        assert_eq!(pod.metadata.name.as_deref(), Some("runner-abc-workflow"));
        assert_eq!(pod.metadata.labels.as_ref().unwrap()["runner-pod"], "runner-abc");
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.node_name.as_deref(), Some("node-1"));
        let volume = &spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "runner-abc-work"
        );
        assert_eq!(spec.image_pull_secrets.as_ref().unwrap()[0].name, "runner-abc-secret-1");
        assert_eq!(spec.containers[0].name, crate::names::JOB_CONTAINER_NAME);
    }

    #[test]
    fn test_prepend_path_defaults_base() {
        let mut container = Container::default();
        prepend_path(&mut container, &["/opt/bin".to_string()]);

        let env = container.env.unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, "PATH");
        assert_eq!(
            env[0].value.as_deref(),
            Some("/opt/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
        );
    }

    #[test]
    fn test_prepend_path_keeps_step_path() {
        let mut container = Container {
            env: Some(vec![
                EnvVar {
                    name: "PATH".to_string(),
                    value: Some("/custom/bin".to_string()),
                    ..EnvVar::default()
                },
                EnvVar {
                    name: "CI".to_string(),
                    value: Some("true".to_string()),
                    ..EnvVar::default()
                },
            ]),
            ..Container::default()
        };
        prepend_path(&mut container, &["/a".to_string(), "/b".to_string()]);

        let env = container.env.unwrap();
        let path: Vec<_> = env.iter().filter(|v| v.name == "PATH").collect();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].value.as_deref(), Some("/a:/b:/custom/bin"));

        let mut untouched = Container::default();
        prepend_path(&mut untouched, &[]);
        assert!(untouched.env.is_none());
    }

    #[test]
    fn test_step_job_settings() {
        let job = step_job(
            &config(),
            "runner-abc-step-1",
            Container::default(),
            None,
            &[],
        );
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(300));
        assert!(spec.template.spec.unwrap().image_pull_secrets.is_none());
    }

    #[test]
    fn test_registry_secret_payload() {
        let registry = Registry {
            server_url: String::new(),
            username: Some("bot".to_string()),
            password: Some("pw".to_string()),
        };
        let secret = registry_secret(&config(), "s1", &registry);
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));

        let raw = &secret.data.unwrap()[".dockerconfigjson"];
        let value: serde_json::Value = serde_json::from_slice(&raw.0).unwrap();
        assert_eq!(
            value["auths"][DEFAULT_REGISTRY]["auth"],
            STANDARD.encode("bot:pw")
        );
    }
}
