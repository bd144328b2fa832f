//! Rendezvous configuration for multi-process runs.
//!
//! # Environment Variables
//!
//! Workers are configured with the standard distributed-launch variables:
//! - `RANK`: Global rank of this process (0..WORLD_SIZE)
//! - `WORLD_SIZE`: Total number of processes
//! - `LOCAL_RANK`: Local rank on this node (defaults to `RANK`)
//! - `MASTER_ADDR`: Address of rank 0 for coordination (default: 127.0.0.1)
//! - `MASTER_PORT`: Port for coordination (default: 29500)
//!
//! # Usage
//!
//! ```ignore
//! use dpsync_core::distributed::DistributedConfig;
//!
//! match DistributedConfig::detect()? {
//!     Some(config) => println!("rank {} of {}", config.rank, config.world_size),
//!     None => println!("not launched under a multi-process runner"),
//! }
//! ```

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{DistributedError, Result};

pub const RANK_ENV: &str = "RANK";
pub const WORLD_SIZE_ENV: &str = "WORLD_SIZE";
pub const LOCAL_RANK_ENV: &str = "LOCAL_RANK";
pub const MASTER_ADDR_ENV: &str = "MASTER_ADDR";
pub const MASTER_PORT_ENV: &str = "MASTER_PORT";

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Distributed configuration from environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Global rank of this process.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// Local rank on this node.
    pub local_rank: usize,
    /// Master address for coordination.
    pub master_addr: String,
    /// Master port for coordination.
    pub master_port: u16,
}

impl DistributedConfig {
    /// Read the rendezvous variables.
    ///
    /// Returns `Ok(None)` when `WORLD_SIZE` is unset, i.e. the process was
    /// not started by a multi-process runner. A present but inconsistent
    /// environment is an [`DistributedError::Initialization`] error.
    pub fn detect() -> Result<Option<Self>> {
        let Some(world_size) = env::var(WORLD_SIZE_ENV).ok() else {
            return Ok(None);
        };
        let world_size: usize = parse_var(WORLD_SIZE_ENV, &world_size)?;
        if world_size == 0 {
            return Err(DistributedError::Initialization(format!(
                "{WORLD_SIZE_ENV} must be >= 1"
            )));
        }

        let rank: usize = match env::var(RANK_ENV) {
            Ok(raw) => parse_var(RANK_ENV, &raw)?,
            Err(_) => {
                return Err(DistributedError::Initialization(format!(
                    "{WORLD_SIZE_ENV} is set but {RANK_ENV} is not"
                )))
            }
        };
        if rank >= world_size {
            return Err(DistributedError::Initialization(format!(
                "{RANK_ENV}={rank} is out of range for {WORLD_SIZE_ENV}={world_size}"
            )));
        }

        let local_rank = match env::var(LOCAL_RANK_ENV) {
            Ok(raw) => parse_var(LOCAL_RANK_ENV, &raw)?,
            Err(_) => rank,
        };

        let master_addr =
            env::var(MASTER_ADDR_ENV).unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string());

        let master_port = match env::var(MASTER_PORT_ENV) {
            Ok(raw) => parse_var(MASTER_PORT_ENV, &raw)?,
            Err(_) => DEFAULT_MASTER_PORT,
        };

        Ok(Some(Self {
            rank,
            world_size,
            local_rank,
            master_addr,
            master_port,
        }))
    }

    /// `host:port` of rank 0's rendezvous listener.
    pub fn master_endpoint(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }

    /// The environment a worker needs to reproduce this configuration.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (RANK_ENV, self.rank.to_string()),
            (WORLD_SIZE_ENV, self.world_size.to_string()),
            (LOCAL_RANK_ENV, self.local_rank.to_string()),
            (MASTER_ADDR_ENV, self.master_addr.clone()),
            (MASTER_PORT_ENV, self.master_port.to_string()),
        ]
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        DistributedError::Initialization(format!("{name}={raw:?} is not a valid value"))
    })
}
