//! Distributed coordination for data-parallel training.
//!
//! This module provides:
//! - [`ProcessGroupContext`] - Per-process session (rank, world size, lifecycle)
//! - [`Communicator`] - Broadcast/all-reduce/reduce over nested [`Payload`]s
//! - [`synchronize`] - Align replicas from a root rank
//! - [`allreduce_gradients`] / [`DistributedOptimizer`] - Gradient summation
//! - [`Transport`] - The message-passing substrate (TCP or in-process)
//!
//! # Architecture
//!
//! - Single process: every collective is an identity (world_size=1 bypass)
//! - Multi process: one progress thread per rank executes collectives in
//!   submission order over a full mesh of point-to-point links
//!
//! # Usage
//!
//! ```ignore
//! use dpsync_core::distributed::{
//!     Communicator, DistributedOptimizer, InitOptions, ProcessGroupContext,
//! };
//!
//! let ctx = ProcessGroupContext::initialized(InitOptions::from_env()?)?;
//! let comm = Communicator::new(ctx.clone());
//! dpsync_core::distributed::synchronize_var_map(&comm, &var_map, 0)?;
//! let mut opt = DistributedOptimizer::<candle_nn::SGD>::from_var_map(&var_map, 0.01, comm)?;
//! // per step:
//! opt.backward_step(&loss)?;
//! ctx.finalize()?;
//! ```

mod communicator;
mod context;
mod engine;
mod error;
mod gradients;
mod launcher;
mod local;
mod payload;
mod printing;
mod process_group;
mod sync;
mod tcp;
mod transport;
pub mod wire;

pub use communicator::{Communicator, PendingPayload};
pub use context::{
    BackendKind, InitOptions, ProcessGroupContext, Session, ACCELERATOR_AWARE_ENV, BACKEND_ENV,
    CONNECT_TIMEOUT_ENV, DISABLE_ACCELERATOR_AWARE_ENV, VERIFY_STRUCTURE_ENV,
};
pub use engine::Links;
pub use error::{DistributedError, Result};
pub use gradients::{
    allreduce_grad_store, allreduce_gradients, reduce_gradients_after, sorted_vars, DistributedOptimizer,
};
pub use launcher::{
    DistributedConfig, DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT, LOCAL_RANK_ENV, MASTER_ADDR_ENV,
    MASTER_PORT_ENV, RANK_ENV, WORLD_SIZE_ENV,
};
pub use local::{local_links, local_world, run_local_world, LocalLinks};
pub use payload::{Payload, Scalar};
pub use printing::{format_line, print_all, print_rank0, rank0_line};
pub use process_group::{check_rank, ProcessGroup, StaticProcessGroup};
pub use sync::{synchronize, synchronize_var_map, synchronize_vars};
pub use tcp::{connect as connect_tcp, rendezvous, TcpLinks};
pub use transport::{Collective, HostTransport, PendingCollective, ReduceOp, Transport};
