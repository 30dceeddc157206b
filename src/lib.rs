//! Per-service init-script supervisor: lifecycle state machine and
//! dependency-aware coordination with sibling services in a shared on-disk
//! service directory.
#![warn(unused_crate_dependencies)]
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// Command-line interface.
pub mod cli;

/// Execution environment assembly.
pub mod config;

/// Paths, timing, and hook-name constants.
pub mod constants;

/// Control-Epoch Guard.
pub mod control;

/// Dependency Oracle.
pub mod deptree;

/// Errors.
pub mod error;

/// Exclusion & Presence, Peer Waiter.
pub mod exclusive;

/// Hook dispatch.
pub mod hooks;

/// Lifecycle Engine.
pub mod lifecycle;

/// Line-prefixing for child output.
pub mod prefixer;

/// Script Runner.
pub mod runner;

/// State Store.
pub mod state;
