//! Berth Core
//!
//! Shared types and abstractions for the berth container hook.
//!
//! This crate contains:
//! - Domain types: containers, job state, response context, health
//! - DTOs: the runner's hook payload and per-command arguments
//! - Configuration read from the runner environment
//! - The [`Backend`] trait implemented by each container backend
//! - Port codecs and backoff helpers used by every backend

pub mod backend;
pub mod backoff;
pub mod config;
pub mod domain;
pub mod dto;
pub mod error;
pub mod ports;

pub use backend::Backend;
pub use config::{BackendKind, Config};
pub use error::{HookError, Result};
