//! Berth Kubernetes
//!
//! Cluster-scheduler backend. Runs the job container and its services as
//! one pod pinned to the runner's node:
//! - Access self-checks before anything is created
//! - Pod, step job and image pull secret manifests, with an optional
//!   operator pod template merged in
//! - Workspace copy-in over exec and script steps in the job container
//! - Label based pruning of everything a runner created

pub mod backend;
pub mod client;
pub mod copy;
pub mod manifest;
pub mod names;
pub mod permissions;
pub mod script;
pub mod template;
pub mod wait;

#[cfg(test)]
mod testing;

pub use backend::KubernetesBackend;
pub use client::{ClusterClient, KubeClient};
