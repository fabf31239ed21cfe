//! Cluster API access
//!
//! [`ClusterClient`] is the narrow surface the backend needs from the API
//! server: pod, job and secret CRUD, exec with streams, log streaming and
//! access self-checks. [`KubeClient`] implements it on top of `kube`.

use async_trait::async_trait;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use berth_core::error::{HookError, Result};

use crate::permissions::Permission;

/// Streams attached to an exec call
#[derive(Debug, Clone, Default)]
pub struct ExecIo {
    /// File streamed into the process stdin
    pub stdin: Option<PathBuf>,
    /// Capture stdout/stderr instead of forwarding them to this process
    pub capture: bool,
}

impl ExecIo {
    pub fn captured() -> Self {
        Self {
            stdin: None,
            capture: true,
        }
    }

    pub fn forwarded() -> Self {
        Self::default()
    }
}

/// Outcome of an exec call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Failure description for error messages
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(code) = self.exit_code {
            parts.push(format!("exit code {}", code));
        }
        if let Some(message) = self.message.as_deref().filter(|m| !m.is_empty()) {
            parts.push(message.to_string());
        }
        if !self.stderr.trim().is_empty() {
            parts.push(self.stderr.trim().to_string());
        }
        if parts.is_empty() {
            "command failed".to_string()
        } else {
            parts.join(": ")
        }
    }
}

/// Cluster operations used by the backend
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Namespace every call targets
    fn namespace(&self) -> &str;

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>>;
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;
    /// Deletes a pod; one that does not exist counts as deleted
    async fn delete_pod(&self, name: &str) -> Result<()>;
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;
    async fn delete_secret(&self, name: &str) -> Result<()>;
    async fn list_secrets(&self, selector: &str) -> Result<Vec<Secret>>;

    async fn create_job(&self, job: &Job) -> Result<Job>;
    async fn get_job(&self, name: &str) -> Result<Option<Job>>;
    async fn delete_job(&self, name: &str) -> Result<()>;
    async fn list_jobs(&self, selector: &str) -> Result<Vec<Job>>;

    /// Runs a command in a container of a running pod
    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        io: ExecIo,
    ) -> Result<ExecOutput>;

    /// Follows a container's log to this process's stdout until it ends
    async fn stream_logs(&self, pod: &str, container: &str) -> Result<()>;

    /// Whether the current identity may perform `verb` on the resource
    async fn access_allowed(&self, permission: &Permission, verb: &str) -> Result<bool>;
}

fn api_error(call: impl Into<String>, error: kube::Error) -> HookError {
    let message = match &error {
        kube::Error::Api(response) => response.message.clone(),
        other => other.to_string(),
    };
    HookError::backend(call, message)
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

/// [`ClusterClient`] backed by the in-cluster or kubeconfig credentials
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    namespace: String,
}

impl KubeClient {
    /// Connects using the default credentials; the namespace falls back to
    /// the client's default namespace
    pub async fn connect(namespace: Option<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| HookError::Configuration(format!("failed to create cluster client: {}", e)))?;
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
        info!("Using namespace {}", namespace);
        Ok(Self { client, namespace })
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn get<K>(&self, kind: &str, name: &str) -> Result<Option<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        match self.api::<K>().get(name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(api_error(format!("get {} {}", kind, name), e)),
        }
    }

    async fn delete<K>(&self, kind: &str, name: &str, params: &DeleteParams) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        match self.api::<K>().delete(name, params).await {
            Ok(_) => {
                debug!("Deleted {} {}", kind, name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!("{} {} already deleted", kind, name);
                Ok(())
            }
            Err(e) => Err(api_error(format!("delete {} {}", kind, name), e)),
        }
    }

    async fn list<K>(&self, kind: &str, selector: &str) -> Result<Vec<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let params = ListParams::default().labels(selector);
        self.api::<K>()
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| api_error(format!("list {} {}", kind, selector), e))
    }
}

/// Reads a stream to the end, or forwards it when not capturing
async fn drain<R>(reader: Option<R>, capture: bool, to_stderr: bool) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    if capture {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        return Ok(String::from_utf8_lossy(&buf).to_string());
    }
    if to_stderr {
        tokio::io::copy(&mut reader, &mut tokio::io::stderr()).await?;
    } else {
        tokio::io::copy(&mut reader, &mut tokio::io::stdout()).await?;
    }
    Ok(String::new())
}

/// Exit code carried in the `ExitCode` cause of a failed exec status
fn exit_code(status: &Status) -> Option<i32> {
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        .and_then(|cause| cause.message.as_deref()?.parse().ok())
}

/// Maps the final exec status; a call that never reported one failed
fn exec_output(status: Option<Status>, stdout: String, stderr: String) -> ExecOutput {
    match status {
        Some(status) => ExecOutput {
            success: status.status.as_deref() == Some("Success"),
            exit_code: exit_code(&status),
            message: status.message,
            stdout,
            stderr,
        },
        None => ExecOutput {
            success: false,
            exit_code: None,
            message: Some("no status received from exec".to_string()),
            stdout,
            stderr,
        },
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        self.get::<Pod>("pod", name).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.api::<Pod>()
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| api_error(format!("create pod {}", name), e))
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        self.delete::<Pod>("pod", name, &params).await
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        self.list::<Pod>("pods", selector).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.api::<Secret>()
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| api_error(format!("create secret {}", name), e))
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.delete::<Secret>("secret", name, &DeleteParams::default())
            .await
    }

    async fn list_secrets(&self, selector: &str) -> Result<Vec<Secret>> {
        self.list::<Secret>("secrets", selector).await
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.api::<Job>()
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| api_error(format!("create job {}", name), e))
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        self.get::<Job>("job", name).await
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        // Background propagation removes the job's pods as well
        self.delete::<Job>("job", name, &DeleteParams::background())
            .await
    }

    async fn list_jobs(&self, selector: &str) -> Result<Vec<Job>> {
        self.list::<Job>("jobs", selector).await
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        io: ExecIo,
    ) -> Result<ExecOutput> {
        let call = format!("exec in {}/{}", pod, container);
        let params = AttachParams::default()
            .container(container)
            .stdin(io.stdin.is_some())
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .api::<Pod>()
            .exec(pod, command, &params)
            .await
            .map_err(|e| api_error(call.clone(), e))?;
        let status = attached.take_status();

        // The writer stays alive until the status arrives: dropping it closes
        // the whole socket before the remote process reports back.
        let mut stdin = attached.stdin();
        let feed = async {
            if let (Some(path), Some(stdin)) = (io.stdin.as_ref(), stdin.as_mut()) {
                let mut file = tokio::fs::File::open(path).await?;
                tokio::io::copy(&mut file, stdin).await?;
                stdin.flush().await?;
            }
            Ok::<_, HookError>(())
        };

        let ((), stdout, stderr) = tokio::try_join!(
            feed,
            drain(attached.stdout(), io.capture, false),
            drain(attached.stderr(), io.capture, true),
        )?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        drop(stdin);
        attached
            .join()
            .await
            .map_err(|e| HookError::backend(call, e.to_string()))?;

        Ok(exec_output(status, stdout, stderr))
    }

    async fn stream_logs(&self, pod: &str, container: &str) -> Result<()> {
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            pretty: false,
            timestamps: false,
            ..LogParams::default()
        };
        let call = format!("logs of {}/{}", pod, container);
        let stream = self
            .api::<Pod>()
            .log_stream(pod, &params)
            .await
            .map_err(|e| api_error(call.clone(), e))?;

        let mut lines = stream.lines();
        while let Some(line) = lines
            .try_next()
            .await
            .map_err(|e| HookError::backend(call.clone(), e.to_string()))?
        {
            println!("{}", line);
        }
        Ok(())
    }

    async fn access_allowed(&self, permission: &Permission, verb: &str) -> Result<bool> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    group: Some(permission.group.to_string()),
                    namespace: Some(self.namespace.clone()),
                    resource: Some(permission.resource.to_string()),
                    subresource: Some(permission.subresource.to_string()),
                    verb: Some(verb.to_string()),
                    ..ResourceAttributes::default()
                }),
                ..SelfSubjectAccessReviewSpec::default()
            },
            ..SelfSubjectAccessReview::default()
        };

        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let created = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| {
                api_error(
                    format!("access review {} {}", verb, permission.display_resource()),
                    e,
                )
            })?;
        Ok(created.status.is_some_and(|status| status.allowed))
    }
}
