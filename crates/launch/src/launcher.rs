//! Multi-process launcher for data-parallel workers.
//!
//! Starts `nproc_per_node` copies of a worker program on this host, each
//! distinguished by the standard distributed environment variables:
//!
//! | Variable      | Value                  | Consumed by |
//! |---------------|------------------------|-------------|
//! | `RANK`        | 0..N-1                 | `DistributedConfig::detect()` |
//! | `WORLD_SIZE`  | N                      | `DistributedConfig::detect()` |
//! | `LOCAL_RANK`  | same as `RANK`         | `DistributedConfig::detect()` |
//! | `MASTER_ADDR` | `--master-addr`        | TCP rendezvous |
//! | `MASTER_PORT` | `--master-port`        | TCP rendezvous |
//! | `DPSYNC_*`    | backend / staging / verification flags | `InitOptions::from_env()` |
//!
//! The launcher waits for every worker. When one fails, the rest are killed
//! (a peer blocked in a collective would otherwise wait forever) and the
//! launcher reports the first failing worker's exit code.

use std::ffi::OsString;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use dpsync_core::distributed::{
    BackendKind, DistributedConfig, BACKEND_ENV, CONNECT_TIMEOUT_ENV,
    DISABLE_ACCELERATOR_AWARE_ENV, VERIFY_STRUCTURE_ENV,
};

use crate::config::LaunchConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to start the workers.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub nproc_per_node: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub backend: BackendKind,
    pub disable_accelerator_aware: bool,
    pub verify_structure: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl LaunchPlan {
    /// Resolve a merged configuration against the worker command line.
    pub fn new(config: &LaunchConfig, program: OsString, args: Vec<OsString>) -> anyhow::Result<Self> {
        let nproc_per_node = config.nproc_per_node();
        anyhow::ensure!(nproc_per_node > 0, "--nproc-per-node must be at least 1");
        anyhow::ensure!(
            config.backend() == BackendKind::Tcp || nproc_per_node == 1,
            "backend {} supports a single process, got --nproc-per-node {nproc_per_node}",
            config.backend()
        );

        Ok(Self {
            nproc_per_node,
            master_addr: config.master_addr().to_string(),
            master_port: config.master_port(),
            backend: config.backend(),
            disable_accelerator_aware: config.disable_accelerator_aware.unwrap_or(false),
            verify_structure: config.verify_structure,
            connect_timeout_ms: config.connect_timeout_ms,
            program,
            args,
        })
    }

    /// Rendezvous view of `rank`. Single node, so `LOCAL_RANK == RANK`.
    pub fn distributed_config(&self, rank: usize) -> DistributedConfig {
        DistributedConfig {
            rank,
            world_size: self.nproc_per_node,
            local_rank: rank,
            master_addr: self.master_addr.clone(),
            master_port: self.master_port,
        }
    }

    /// Environment exported to the worker of `rank`.
    pub fn worker_env(&self, rank: usize) -> Vec<(&'static str, String)> {
        let mut env = self.distributed_config(rank).to_env();
        env.push((BACKEND_ENV, self.backend.to_string()));
        if self.disable_accelerator_aware {
            env.push((DISABLE_ACCELERATOR_AWARE_ENV, "1".to_string()));
        }
        if let Some(verify) = self.verify_structure {
            env.push((VERIFY_STRUCTURE_ENV, verify.to_string()));
        }
        if let Some(timeout_ms) = self.connect_timeout_ms {
            env.push((CONNECT_TIMEOUT_ENV, timeout_ms.to_string()));
        }
        env
    }

    /// Start one process per rank.
    ///
    /// If a spawn fails, the workers already started are killed.
    pub fn spawn(&self) -> anyhow::Result<Vec<Worker>> {
        let mut workers = Vec::with_capacity(self.nproc_per_node);
        for rank in 0..self.nproc_per_node {
            tracing::info!(
                rank,
                world_size = self.nproc_per_node,
                master_port = self.master_port,
                "spawning worker"
            );

            let spawned = Command::new(&self.program)
                .args(&self.args)
                .envs(self.worker_env(rank))
                .spawn()
                .with_context(|| {
                    format!(
                        "failed to spawn worker rank {rank} ({})",
                        self.program.to_string_lossy()
                    )
                });
            match spawned {
                Ok(child) => workers.push(Worker { rank, child }),
                Err(e) => {
                    kill_all(&mut workers);
                    return Err(e);
                }
            }
        }

        tracing::info!(count = workers.len(), "all workers spawned");
        Ok(workers)
    }

    /// Spawn, wait, and return the launcher's exit code.
    pub fn run(&self) -> anyhow::Result<i32> {
        let workers = self.spawn()?;
        Ok(wait_for_workers(workers)?.exit_code())
    }
}

/// A running worker process.
#[derive(Debug)]
pub struct Worker {
    pub rank: usize,
    child: Child,
}

/// How the worker group ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Success,
    /// The first worker observed to fail.
    Failed { rank: usize, code: i32 },
}

impl LaunchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed { code, .. } => *code,
        }
    }
}

/// Exit code of a finished worker. Signal deaths map to 1.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

fn kill_all(workers: &mut [Worker]) {
    for worker in workers.iter_mut() {
        if let Err(e) = worker.child.kill() {
            tracing::debug!(rank = worker.rank, error = %e, "kill failed (already exited?)");
        }
        if let Err(e) = worker.child.wait() {
            tracing::warn!(rank = worker.rank, error = %e, "error reaping worker");
        }
    }
}

/// Wait until every worker exits, or until the first failure.
///
/// On failure the remaining workers are killed and reaped before returning.
pub fn wait_for_workers(mut workers: Vec<Worker>) -> anyhow::Result<LaunchOutcome> {
    while !workers.is_empty() {
        let mut failed = None;
        let mut i = 0;
        while i < workers.len() {
            let status = workers[i]
                .child
                .try_wait()
                .with_context(|| format!("error waiting for worker rank {}", workers[i].rank))?;
            match status {
                None => i += 1,
                Some(status) => {
                    let worker = workers.swap_remove(i);
                    if status.success() {
                        tracing::debug!(rank = worker.rank, "worker exited cleanly");
                    } else {
                        tracing::error!(rank = worker.rank, ?status, "worker failed");
                        failed = Some(LaunchOutcome::Failed {
                            rank: worker.rank,
                            code: exit_code(status),
                        });
                        break;
                    }
                }
            }
        }

        if let Some(outcome) = failed {
            if !workers.is_empty() {
                tracing::warn!(remaining = workers.len(), "terminating remaining workers");
                kill_all(&mut workers);
            }
            return Ok(outcome);
        }
        if !workers.is_empty() {
            thread::sleep(POLL_INTERVAL);
        }
    }

    tracing::info!("all workers exited cleanly");
    Ok(LaunchOutcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn plan(nproc: usize, program: &str, args: &[&str]) -> LaunchPlan {
        let config = LaunchConfig {
            nproc_per_node: Some(nproc),
            master_port: Some(29777),
            ..Default::default()
        };
        LaunchPlan::new(
            &config,
            program.into(),
            args.iter().map(OsString::from).collect(),
        )
        .unwrap()
    }

    fn env_value<'a>(env: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        env.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn worker_env_carries_rendezvous() {
        let mut plan = plan(4, "worker", &[]);
        plan.disable_accelerator_aware = true;
        plan.verify_structure = Some(false);
        let env = plan.worker_env(2);

        assert_eq!(env_value(&env, "RANK"), Some("2"));
        assert_eq!(env_value(&env, "WORLD_SIZE"), Some("4"));
        assert_eq!(env_value(&env, "LOCAL_RANK"), Some("2"));
        assert_eq!(env_value(&env, "MASTER_ADDR"), Some("127.0.0.1"));
        assert_eq!(env_value(&env, "MASTER_PORT"), Some("29777"));
        assert_eq!(env_value(&env, BACKEND_ENV), Some("tcp"));
        assert_eq!(env_value(&env, DISABLE_ACCELERATOR_AWARE_ENV), Some("1"));
        assert_eq!(env_value(&env, VERIFY_STRUCTURE_ENV), Some("false"));
        assert_eq!(env_value(&env, CONNECT_TIMEOUT_ENV), None);
    }

    #[test]
    fn plan_rejects_bad_sizes() {
        let zero = LaunchConfig {
            nproc_per_node: Some(0),
            ..Default::default()
        };
        assert!(LaunchPlan::new(&zero, "w".into(), vec![]).is_err());

        let single = LaunchConfig {
            nproc_per_node: Some(2),
            backend: Some(BackendKind::Single),
            ..Default::default()
        };
        assert!(LaunchPlan::new(&single, "w".into(), vec![]).is_err());
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let plan = plan(2, "/nonexistent/dpsync-worker", &[]);
        assert!(plan.spawn().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn all_workers_succeed() {
        let plan = plan(3, "sh", &["-c", "test \"$RANK\" -lt \"$WORLD_SIZE\""]);
        assert_eq!(plan.run().unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn first_failure_kills_the_rest() {
        // Rank 1 fails immediately; the others would sleep for a minute.
        let plan = plan(
            3,
            "sh",
            &["-c", "if [ \"$RANK\" = 1 ]; then exit 7; fi; sleep 60"],
        );
        let started = Instant::now();
        let outcome = wait_for_workers(plan.spawn().unwrap()).unwrap();
        assert_eq!(outcome, LaunchOutcome::Failed { rank: 1, code: 7 });
        assert_eq!(outcome.exit_code(), 7);
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
