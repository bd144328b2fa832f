//! Launch configuration file.
//!
//! Settings are resolved with the following priority:
//! 1. CLI flags (highest priority)
//! 2. `--config <launch.toml>`
//! 3. Built-in defaults (lowest priority)

use std::fs;
use std::path::Path;

use dpsync_core::distributed::{BackendKind, DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT};
use serde::{Deserialize, Serialize};

/// Persistent launcher settings stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchConfig {
    /// Number of worker processes to start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nproc_per_node: Option<usize>,

    /// Address rank 0 listens on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_addr: Option<String>,

    /// Port rank 0 listens on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_port: Option<u16>,

    /// Transport backend for the workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,

    /// Stage every collective through host memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_accelerator_aware: Option<bool>,

    /// Exchange structure fingerprints before payload collectives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_structure: Option<bool>,

    /// Rendezvous deadline for the workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// Launcher log level when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl LaunchConfig {
    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &LaunchConfig) {
        if other.nproc_per_node.is_some() {
            self.nproc_per_node = other.nproc_per_node;
        }
        if other.master_addr.is_some() {
            self.master_addr = other.master_addr.clone();
        }
        if other.master_port.is_some() {
            self.master_port = other.master_port;
        }
        if other.backend.is_some() {
            self.backend = other.backend;
        }
        if other.disable_accelerator_aware.is_some() {
            self.disable_accelerator_aware = other.disable_accelerator_aware;
        }
        if other.verify_structure.is_some() {
            self.verify_structure = other.verify_structure;
        }
        if other.connect_timeout_ms.is_some() {
            self.connect_timeout_ms = other.connect_timeout_ms;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
    }

    pub fn nproc_per_node(&self) -> usize {
        self.nproc_per_node.unwrap_or(1)
    }

    pub fn master_addr(&self) -> &str {
        self.master_addr.as_deref().unwrap_or(DEFAULT_MASTER_ADDR)
    }

    pub fn master_port(&self) -> u16 {
        self.master_port.unwrap_or(DEFAULT_MASTER_PORT)
    }

    /// Workers always rendezvous over TCP unless told otherwise.
    pub fn backend(&self) -> BackendKind {
        self.backend.unwrap_or(BackendKind::Tcp)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
