//! In-memory cluster used by the backend tests

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodSpec, PodStatus, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use berth_core::error::{HookError, Result};

use crate::client::{ClusterClient, ExecIo, ExecOutput};
use crate::names::{JOB_CONTAINER_NAME, JOB_NAME_LABEL_KEY, RUNNER_LABEL_KEY};
use crate::permissions::Permission;

/// One recorded exec call
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    /// Entry paths of the tar archive streamed on stdin
    pub archive: Vec<String>,
    /// Size in bytes of the archive streamed on stdin
    pub archive_len: u64,
}

#[derive(Default)]
struct Inner {
    pods: BTreeMap<String, Pod>,
    secrets: BTreeMap<String, Secret>,
    jobs: BTreeMap<String, Job>,
    phases: HashMap<String, VecDeque<String>>,
    created_pods: Vec<String>,
    last_job: Option<Job>,
    denied: BTreeSet<(String, String)>,
    exec_failures: Vec<(String, String)>,
    execs: Vec<ExecCall>,
    logs: Vec<(String, String)>,
    failing_deletions: BTreeSet<String>,
    pod_creation_failure: Option<String>,
    alpine: bool,
    step_exit_code: i32,
}

/// A namespace worth of pods, jobs and secrets
pub struct FakeCluster {
    inner: Mutex<Inner>,
}

fn named(name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels),
        ..ObjectMeta::default()
    }
}

fn with_phase(mut pod: Pod, phase: &str) -> Pod {
    pod.status.get_or_insert_with(PodStatus::default).phase = Some(phase.to_string());
    pod
}

fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    let Some((key, value)) = selector.split_once('=') else {
        return true;
    };
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .is_some_and(|v| v == value)
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Seeds the unlabelled runner pod scheduled on `node`
    pub fn add_runner_pod(&self, name: &str, node: &str) {
        let pod = Pod {
            metadata: named(name, BTreeMap::new()),
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..PodSpec::default()
            }),
            ..Pod::default()
        };
        self.lock().pods.insert(name.to_string(), with_phase(pod, "Running"));
    }

    /// Seeds a pod that reports `phases` in order, then stays in the last one
    pub fn add_pod(&self, name: &str, phases: &[&str]) {
        let pod = Pod {
            metadata: named(name, BTreeMap::new()),
            ..Pod::default()
        };
        let mut inner = self.lock();
        inner.pods.insert(name.to_string(), pod);
        inner.phases.insert(
            name.to_string(),
            phases.iter().map(|p| p.to_string()).collect(),
        );
    }

    /// Seeds a running pod labelled for `runner`
    pub fn add_labelled_pod(&self, name: &str, runner: &str) {
        let labels = BTreeMap::from([(RUNNER_LABEL_KEY.to_string(), runner.to_string())]);
        let pod = Pod {
            metadata: named(name, labels),
            ..Pod::default()
        };
        self.lock()
            .pods
            .insert(name.to_string(), with_phase(pod, "Running"));
    }

    /// Phases a pod created later under `name` reports
    pub fn script_phases(&self, name: &str, phases: &[&str]) {
        self.lock().phases.insert(
            name.to_string(),
            phases.iter().map(|p| p.to_string()).collect(),
        );
    }

    /// Denies `verb` on `resource` (`pods`, `pods/exec`, ...)
    pub fn deny(&self, resource: &str, verb: &str) {
        self.lock()
            .denied
            .insert((resource.to_string(), verb.to_string()));
    }

    /// Fails every exec whose command line contains `needle`
    pub fn fail_exec(&self, needle: &str, stderr: &str) {
        self.lock()
            .exec_failures
            .push((needle.to_string(), stderr.to_string()));
    }

    pub fn set_alpine(&self, alpine: bool) {
        self.lock().alpine = alpine;
    }

    pub fn set_step_exit_code(&self, code: i32) {
        self.lock().step_exit_code = code;
    }

    /// Makes deleting the named object fail
    pub fn fail_deletion(&self, name: &str) {
        self.lock().failing_deletions.insert(name.to_string());
    }

    pub fn fail_pod_creation(&self, message: &str) {
        self.lock().pod_creation_failure = Some(message.to_string());
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.lock().pods.get(name).cloned()
    }

    /// Names of every pod created through the client, in order
    pub fn created_pods(&self) -> Vec<String> {
        self.lock().created_pods.clone()
    }

    pub fn labelled_pods(&self, runner: &str) -> Vec<String> {
        let selector = format!("{}={}", RUNNER_LABEL_KEY, runner);
        self.lock()
            .pods
            .values()
            .filter(|p| matches_selector(&p.metadata, &selector))
            .filter_map(|p| p.metadata.name.clone())
            .collect()
    }

    pub fn secret_names(&self) -> Vec<String> {
        self.lock().secrets.keys().cloned().collect()
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.lock().execs.clone()
    }

    pub fn last_job(&self) -> Option<Job> {
        self.lock().last_job.clone()
    }

    pub fn streamed_logs(&self) -> Vec<(String, String)> {
        self.lock().logs.clone()
    }

    fn delete_from<T>(
        &self,
        kind: &str,
        name: &str,
        objects: impl FnOnce(&mut Inner) -> &mut BTreeMap<String, T>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.failing_deletions.contains(name) {
            return Err(HookError::backend(
                format!("delete {} {}", kind, name),
                "Internal error occurred",
            ));
        }
        objects(&mut *inner).remove(name);
        Ok(())
    }
}

fn read_archive(path: &std::path::Path) -> Vec<String> {
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let mut archive = tar::Archive::new(file);
    let Ok(entries) = archive.entries() else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.path().ok().map(|p| p.to_string_lossy().to_string()))
        .collect()
}

#[async_trait]
impl ClusterClient for FakeCluster {
    fn namespace(&self) -> &str {
        "default"
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        let mut inner = self.lock();
        let phase = inner.phases.get_mut(name).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        Ok(inner.pods.get(name).cloned().map(|pod| match phase {
            Some(phase) => with_phase(pod, &phase),
            None => pod,
        }))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut inner = self.lock();
        if let Some(message) = &inner.pod_creation_failure {
            return Err(HookError::backend(format!("create pod {}", name), message.clone()));
        }
        if inner.pods.contains_key(&name) {
            return Err(HookError::backend(
                format!("create pod {}", name),
                format!("pods \"{}\" already exists", name),
            ));
        }
        let created = with_phase(pod.clone(), "Running");
        inner.pods.insert(name.clone(), created.clone());
        inner.created_pods.push(name);
        Ok(created)
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.delete_from("pod", name, |inner| &mut inner.pods)
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|p| matches_selector(&p.metadata, selector))
            .cloned()
            .collect())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.lock().secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.delete_from("secret", name, |inner| &mut inner.secrets)
    }

    async fn list_secrets(&self, selector: &str) -> Result<Vec<Secret>> {
        Ok(self
            .lock()
            .secrets
            .values()
            .filter(|s| matches_selector(&s.metadata, selector))
            .cloned()
            .collect())
    }

    /// Runs the job to completion at once: its pod terminates with the
    /// configured step exit code
    async fn create_job(&self, job: &Job) -> Result<Job> {
        let name = job.metadata.name.clone().unwrap_or_default();
        let mut inner = self.lock();
        let exit_code = inner.step_exit_code;

        let mut labels = job
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        labels.insert(JOB_NAME_LABEL_KEY.to_string(), name.clone());

        let pod_name = format!("{}-pod", name);
        let pod = Pod {
            metadata: named(&pod_name, labels),
            spec: job.spec.as_ref().and_then(|s| s.template.spec.clone()),
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: JOB_CONTAINER_NAME.to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            ..ContainerStateTerminated::default()
                        }),
                        ..ContainerState::default()
                    }),
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }),
        };
        inner.pods.insert(pod_name, with_phase(pod, "Succeeded"));

        let mut stored = job.clone();
        stored.status = Some(if exit_code == 0 {
            JobStatus {
                succeeded: Some(1),
                ..JobStatus::default()
            }
        } else {
            JobStatus {
                failed: Some(1),
                ..JobStatus::default()
            }
        });
        inner.jobs.insert(name, stored);
        inner.last_job = Some(job.clone());
        Ok(job.clone())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(name).cloned())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.delete_from("job", name, |inner| &mut inner.jobs)?;
        let selector = format!("{}={}", JOB_NAME_LABEL_KEY, name);
        self.lock()
            .pods
            .retain(|_, pod| !matches_selector(&pod.metadata, &selector));
        Ok(())
    }

    async fn list_jobs(&self, selector: &str) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| matches_selector(&j.metadata, selector))
            .cloned()
            .collect())
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        io: ExecIo,
    ) -> Result<ExecOutput> {
        let archive = io.stdin.as_deref().map(read_archive).unwrap_or_default();
        let archive_len = io
            .stdin
            .as_deref()
            .and_then(|path| std::fs::metadata(path).ok())
            .map_or(0, |meta| meta.len());
        let line = command.join(" ");

        let mut inner = self.lock();
        inner.execs.push(ExecCall {
            pod: pod.to_string(),
            container: container.to_string(),
            command,
            archive,
            archive_len,
        });

        if let Some((_, stderr)) = inner
            .exec_failures
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
        {
            return Ok(ExecOutput {
                success: false,
                exit_code: Some(1),
                message: Some("command terminated with non-zero exit code".to_string()),
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }

        let success = !line.contains("/etc/*release*") || inner.alpine;
        Ok(ExecOutput {
            success,
            exit_code: (!success).then_some(1),
            ..ExecOutput::default()
        })
    }

    async fn stream_logs(&self, pod: &str, container: &str) -> Result<()> {
        self.lock()
            .logs
            .push((pod.to_string(), container.to_string()));
        Ok(())
    }

    async fn access_allowed(&self, permission: &Permission, verb: &str) -> Result<bool> {
        let key = (permission.display_resource(), verb.to_string());
        Ok(!self.lock().denied.contains(&key))
    }
}
