//! Job state threaded between hook invocations
//!
//! Every invocation is a fresh process, so `prepare_job` hands the runner a
//! small serialized blob and later invocations pass it back. The blob is
//! tagged with the backend that produced it and a format version, so
//! `cleanup_job` can always decode it safely.

use serde::{Deserialize, Serialize};

use crate::config::BackendKind;
use crate::error::{HookError, Result};

/// Current state format version
pub const STATE_VERSION: u32 = 1;

/// Opaque (to the runner) state blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(flatten)]
    pub backend: BackendState,
}

fn default_version() -> u32 {
    STATE_VERSION
}

/// Backend specific part of the state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendState {
    Docker(DockerState),
    Kubernetes(KubernetesState),
}

/// Resources created by the local engine backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerState {
    /// Network the containers are attached to
    pub network: Option<String>,
    /// Whether the network was created by this job (and must be removed)
    #[serde(default)]
    pub network_owned: bool,
    /// Job container id
    pub container: Option<String>,
    /// Service container ids
    #[serde(default)]
    pub services: Vec<String>,
}

/// Resources created by the cluster backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesState {
    /// Name of the job pod
    pub job_pod: String,
    /// Image pull secrets created for the pod
    #[serde(default)]
    pub secrets: Vec<String>,
}

impl JobState {
    /// Wraps local engine state
    pub fn docker(state: DockerState) -> Self {
        Self {
            version: STATE_VERSION,
            backend: BackendState::Docker(state),
        }
    }

    /// Wraps cluster state
    pub fn kubernetes(state: KubernetesState) -> Self {
        Self {
            version: STATE_VERSION,
            backend: BackendState::Kubernetes(state),
        }
    }

    /// Which backend produced this state
    pub fn kind(&self) -> BackendKind {
        match self.backend {
            BackendState::Docker(_) => BackendKind::Docker,
            BackendState::Kubernetes(_) => BackendKind::Kubernetes,
        }
    }

    /// Rejects state written by a newer, unknown format
    pub fn check_version(&self) -> Result<()> {
        if self.version > STATE_VERSION {
            return Err(HookError::StateMismatch(format!(
                "state version {} is newer than supported version {}",
                self.version, STATE_VERSION
            )));
        }
        Ok(())
    }

    /// Returns the local engine state or a mismatch error
    pub fn as_docker(&self) -> Result<&DockerState> {
        self.check_version()?;
        match &self.backend {
            BackendState::Docker(state) => Ok(state),
            BackendState::Kubernetes(_) => Err(self.mismatch(BackendKind::Docker)),
        }
    }

    /// Returns the cluster state or a mismatch error
    pub fn as_kubernetes(&self) -> Result<&KubernetesState> {
        self.check_version()?;
        match &self.backend {
            BackendState::Kubernetes(state) => Ok(state),
            BackendState::Docker(_) => Err(self.mismatch(BackendKind::Kubernetes)),
        }
    }

    fn mismatch(&self, expected: BackendKind) -> HookError {
        HookError::StateMismatch(format!(
            "state was produced by the {} backend, but the active backend is {}",
            self.kind(),
            expected
        ))
    }
}
