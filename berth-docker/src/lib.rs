//! Berth Docker
//!
//! Local container-engine backend. Drives a Docker-compatible engine by
//! invoking its CLI:
//! - Network, container and image lifecycle per job
//! - Registry logins scoped to a single pull
//! - Health polling of job and service containers
//! - Label based pruning of everything a runner created

pub mod backend;
pub mod command;
pub mod container;
pub mod image;
pub mod naming;
pub mod network;
pub mod registry;

#[cfg(test)]
mod testing;

pub use backend::DockerBackend;
pub use command::{CommandRunner, DockerCli};
