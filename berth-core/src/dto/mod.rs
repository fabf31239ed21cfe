//! Data Transfer Objects for the runner/hook protocol
//!
//! The runner invokes the hook with a JSON payload on stdin; these types
//! mirror that payload exactly.

pub mod args;
pub mod hook;
