//! Core domain types
//!
//! Containers requested by the runner, the state threaded between
//! invocations, the response context and transient health states.

pub mod container;
pub mod context;
pub mod health;
pub mod state;
