//! Launcher support for dpsync workers: TOML launch configuration, process
//! spawning with fail-fast teardown, and logging setup shared by the binaries.

pub mod config;
pub mod launcher;
pub mod logging;

pub use config::{ConfigError, LaunchConfig};
pub use launcher::{wait_for_workers, LaunchOutcome, LaunchPlan, Worker};
