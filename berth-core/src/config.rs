//! Hook configuration
//!
//! All environment-derived settings are read once at process start into a
//! [`Config`] and passed down explicitly. Required identity variables are
//! validated here, before any backend call is made.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{HookError, Result};

pub const BACKEND_ENV: &str = "BERTH_BACKEND";
pub const RUNNER_NAME_ENV: &str = "RUNNER_NAME";
pub const RUNNER_POD_NAME_ENV: &str = "ACTIONS_RUNNER_POD_NAME";
pub const WORKSPACE_ENV: &str = "GITHUB_WORKSPACE";
pub const RUNNER_WORKSPACE_ENV: &str = "RUNNER_WORKSPACE";
pub const RUNNER_TEMP_ENV: &str = "RUNNER_TEMP";
pub const NAMESPACE_ENV: &str = "ACTIONS_RUNNER_KUBERNETES_NAMESPACE";
pub const NETWORK_ENV: &str = "ACTIONS_RUNNER_NETWORK_DRIVER";
pub const CLAIM_NAME_ENV: &str = "ACTIONS_RUNNER_CLAIM_NAME";
pub const POD_TEMPLATE_ENV: &str = "ACTIONS_RUNNER_POD_TEMPLATE_PATH";
pub const PREPARE_TIMEOUT_ENV: &str = "ACTIONS_RUNNER_PREPARE_JOB_TIMEOUT_SECONDS";

/// Default budget for a pod to come online
pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Which backend drives the job's containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Local Docker-compatible engine, driven through its CLI
    #[default]
    Docker,
    /// Kubernetes API server
    Kubernetes,
}

impl BackendKind {
    /// Environment variable carrying the runner identity for this backend
    pub fn identity_env(&self) -> &'static str {
        match self {
            Self::Docker => RUNNER_NAME_ENV,
            Self::Kubernetes => RUNNER_POD_NAME_ENV,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => f.write_str("docker"),
            Self::Kubernetes => f.write_str("kubernetes"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            other => Err(HookError::Configuration(format!(
                "unknown backend '{}', expected 'docker' or 'kubernetes'",
                other
            ))),
        }
    }
}

/// Hook configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Active backend
    pub backend: BackendKind,

    /// Runner identity: the runner name (docker) or runner pod name (kubernetes)
    pub runner_name: String,

    /// Workspace of the job being run (`GITHUB_WORKSPACE`)
    pub workspace: PathBuf,

    /// Runner workspace (`RUNNER_WORKSPACE`), the parent of the repository checkout
    pub runner_workspace: Option<PathBuf>,

    /// Root for credential stores and temporary archives
    pub temp_dir: PathBuf,

    /// Target namespace; the kube client default when unset
    pub namespace: Option<String>,

    /// Externally supplied network; one is created per job when unset
    pub network: Option<String>,

    /// Work volume claim override
    pub claim_name: Option<String>,

    /// Pod template fragment merged into every pod the hook creates
    pub pod_template_path: Option<PathBuf>,

    /// Budget for the job pod to reach `Running`
    pub prepare_timeout: Duration,
}

impl Config {
    /// Creates a configuration with defaults
    pub fn new(backend: BackendKind, runner_name: String, workspace: PathBuf) -> Self {
        Self {
            backend,
            runner_name,
            workspace,
            runner_workspace: None,
            temp_dir: std::env::temp_dir(),
            namespace: None,
            network: None,
            claim_name: None,
            pod_template_path: None,
            prepare_timeout: DEFAULT_PREPARE_TIMEOUT,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Required: the backend's identity variable (`RUNNER_NAME` or
    /// `ACTIONS_RUNNER_POD_NAME`) and `GITHUB_WORKSPACE`.
    pub fn from_env(backend: BackendKind) -> Result<Self> {
        Self::from_lookup(backend, |key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable source
    pub fn from_lookup<F>(backend: BackendKind, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let identity_env = backend.identity_env();
        let runner_name = get(identity_env).ok_or_else(|| {
            HookError::Configuration(format!(
                "'{}' env is required, please contact your self hosted runner administrator",
                identity_env
            ))
        })?;

        let workspace = get(WORKSPACE_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| HookError::Configuration(format!("{} is not set", WORKSPACE_ENV)))?;

        let prepare_timeout = match get(PREPARE_TIMEOUT_ENV) {
            Some(raw) => {
                let secs = raw.trim().parse::<u64>().map_err(|_| {
                    HookError::Configuration(format!(
                        "{} must be a number of seconds, got '{}'",
                        PREPARE_TIMEOUT_ENV, raw
                    ))
                })?;
                Duration::from_secs(secs)
            }
            None => DEFAULT_PREPARE_TIMEOUT,
        };

        let mut config = Self::new(backend, runner_name, workspace);
        config.runner_workspace = get(RUNNER_WORKSPACE_ENV).map(PathBuf::from);
        if let Some(temp) = get(RUNNER_TEMP_ENV) {
            config.temp_dir = PathBuf::from(temp);
        }
        config.namespace = get(NAMESPACE_ENV);
        config.network = get(NETWORK_ENV);
        config.claim_name = get(CLAIM_NAME_ENV);
        config.pod_template_path = get(POD_TEMPLATE_ENV).map(PathBuf::from);
        config.prepare_timeout = prepare_timeout;

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.runner_name.trim().is_empty() {
            return Err(HookError::Configuration(format!(
                "{} cannot be empty",
                self.backend.identity_env()
            )));
        }

        if self.workspace.as_os_str().is_empty() {
            return Err(HookError::Configuration(format!(
                "{} cannot be empty",
                WORKSPACE_ENV
            )));
        }

        if self.prepare_timeout.is_zero() {
            return Err(HookError::Configuration(format!(
                "{} must be greater than 0",
                PREPARE_TIMEOUT_ENV
            )));
        }

        Ok(())
    }

    /// The runner's `_work` directory, mapped to `/__w` inside containers
    pub fn work_root(&self) -> PathBuf {
        match &self.runner_workspace {
            Some(runner_workspace) => parent_or_self(runner_workspace),
            None => parent_or_self(&parent_or_self(&self.workspace)),
        }
    }
}

fn parent_or_self(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf())
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            BackendKind::Docker,
            "berth-runner".to_string(),
            PathBuf::from("/home/runner/_work/repo/repo"),
        )
    }
}
