//! Message-passing substrate for collective operations.
//!
//! A [`Transport`] executes tensor-level collectives for one rank. Every
//! operation is submitted to the transport and completes through a
//! [`PendingCollective`] handle; the blocking helpers are "submit then wait".
//! Because all ranks submit collectives in the same order and the bundled
//! transports execute them strictly in submission order, matching is
//! preserved without any locking across ranks.

use std::fmt;

use candle_core::{DType, Device, Tensor};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use super::engine::{Engine, Links};
use super::error::{DistributedError, Result};
use super::process_group::{check_rank, ProcessGroup, StaticProcessGroup};
use super::wire;

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise product.
    Product,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Average (sum / world_size).
    Average,
}

impl ReduceOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Product => "product",
            Self::Min => "min",
            Self::Max => "max",
            Self::Average => "average",
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single collective request as seen by one rank.
#[derive(Debug, Clone)]
pub enum Collective {
    /// Root sends `tensor`; other ranks receive into a tensor of the same
    /// shape and dtype as their own `tensor`.
    Broadcast { tensor: Tensor, root: usize },
    /// Every rank ends with the reduction of all ranks' tensors.
    AllReduce { tensor: Tensor, op: ReduceOp },
    /// Only `root` receives the reduction; other ranks complete with no value.
    Reduce {
        tensor: Tensor,
        op: ReduceOp,
        root: usize,
    },
    /// Point-to-point send.
    Send { tensor: Tensor, dst: usize },
    /// Point-to-point receive of a tensor with the given layout.
    Recv {
        src: usize,
        shape: Vec<usize>,
        dtype: DType,
    },
    /// Synchronize all ranks.
    Barrier,
}

impl Collective {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Broadcast { .. } => "broadcast",
            Self::AllReduce { .. } => "all_reduce",
            Self::Reduce { .. } => "reduce",
            Self::Send { .. } => "send",
            Self::Recv { .. } => "recv",
            Self::Barrier => "barrier",
        }
    }

    /// The local input tensor, if the collective carries one.
    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Broadcast { tensor, .. }
            | Self::AllReduce { tensor, .. }
            | Self::Reduce { tensor, .. }
            | Self::Send { tensor, .. } => Some(tensor),
            Self::Recv { .. } | Self::Barrier => None,
        }
    }

    /// Check every rank argument against the group size.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        match self {
            Self::Broadcast { root, .. } | Self::Reduce { root, .. } => {
                check_rank(*root, world_size)
            }
            Self::Send { dst, .. } => check_rank(*dst, world_size),
            Self::Recv { src, dtype, .. } => {
                wire::dtype_code(*dtype)?;
                check_rank(*src, world_size)
            }
            Self::AllReduce { .. } | Self::Barrier => Ok(()),
        }
    }
}

pub(crate) type Completion = Result<Option<Tensor>>;

/// Completion handle for a submitted collective.
///
/// Dropping the handle does not cancel the operation: the transport still
/// runs it to completion so that peers are not left waiting.
#[must_use = "a submitted collective must be waited on"]
#[derive(Debug)]
pub struct PendingCollective {
    kind: &'static str,
    rx: Receiver<Completion>,
}

impl PendingCollective {
    pub(crate) fn channel(kind: &'static str) -> (Sender<Completion>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { kind, rx })
    }

    /// A handle that is already complete.
    pub fn ready(kind: &'static str, result: Result<Option<Tensor>>) -> Self {
        let (tx, pending) = Self::channel(kind);
        // The receiver is alive and the channel has capacity one.
        let _ = tx.send(result);
        pending
    }

    /// Name of the collective this handle belongs to.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Whether the result is available without blocking.
    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Block until the collective completes.
    ///
    /// Returns `None` for collectives that produce no tensor on this rank
    /// (send, barrier, reduce on a non-root rank).
    pub fn wait(self) -> Result<Option<Tensor>> {
        self.rx.recv().map_err(|_| {
            DistributedError::Transport(format!(
                "progress thread exited before completing {}",
                self.kind
            ))
        })?
    }

    /// Block until completion and require a tensor result.
    pub fn wait_tensor(self) -> Result<Tensor> {
        let kind = self.kind;
        self.wait()?.ok_or_else(|| {
            DistributedError::Transport(format!("{kind} completed without a tensor on this rank"))
        })
    }
}

/// Collective-communication substrate for a single rank.
///
/// Implementations must execute submitted collectives in submission order.
pub trait Transport: ProcessGroup + fmt::Debug {
    /// Short backend identifier used in logs (`"tcp"`, `"local"`, ...).
    fn backend_name(&self) -> &'static str;

    /// Whether tensors on `device` can be handed to the transport directly.
    fn supports_device(&self, device: &Device) -> bool {
        device.is_cpu()
    }

    /// Whether the transport can operate on accelerator-resident buffers.
    fn accelerator_capable(&self) -> bool {
        false
    }

    /// Enqueue a collective and return its completion handle.
    fn submit(&self, op: Collective) -> Result<PendingCollective>;

    /// Stop the transport. Later submissions fail; repeated calls are no-ops.
    fn shutdown(&self) -> Result<()>;

    /// Blocking broadcast from `root`.
    fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor> {
        self.submit(Collective::Broadcast {
            tensor: tensor.clone(),
            root,
        })?
        .wait_tensor()
    }

    /// Blocking all-reduce.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        self.submit(Collective::AllReduce {
            tensor: tensor.clone(),
            op,
        })?
        .wait_tensor()
    }

    /// Blocking reduce; `Some` on `root`, `None` elsewhere.
    fn reduce(&self, tensor: &Tensor, op: ReduceOp, root: usize) -> Result<Option<Tensor>> {
        self.submit(Collective::Reduce {
            tensor: tensor.clone(),
            op,
            root,
        })?
        .wait()
    }

    /// Blocking point-to-point send.
    fn send(&self, tensor: &Tensor, dst: usize) -> Result<()> {
        self.submit(Collective::Send {
            tensor: tensor.clone(),
            dst,
        })?
        .wait()
        .map(|_| ())
    }

    /// Blocking point-to-point receive.
    fn recv(&self, shape: &[usize], dtype: DType, src: usize) -> Result<Tensor> {
        self.submit(Collective::Recv {
            src,
            shape: shape.to_vec(),
            dtype,
        })?
        .wait_tensor()
    }

    /// Block until every rank reaches the barrier.
    fn barrier(&self) -> Result<()> {
        self.submit(Collective::Barrier)?.wait().map(|_| ())
    }
}

/// Host-memory transport driven by a progress thread.
///
/// The concrete links (in-process channels or TCP sockets) are moved into
/// the progress thread; this handle only enqueues work.
pub struct HostTransport {
    group: StaticProcessGroup,
    backend: &'static str,
    engine: Engine,
}

impl HostTransport {
    pub fn new<L: Links>(
        group: StaticProcessGroup,
        backend: &'static str,
        links: L,
    ) -> Result<Self> {
        let engine = Engine::spawn(group.rank(), group.world_size(), links)?;
        tracing::debug!(
            rank = group.rank(),
            world_size = group.world_size(),
            backend,
            "Host transport started"
        );
        Ok(Self {
            group,
            backend,
            engine,
        })
    }
}

impl fmt::Debug for HostTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTransport")
            .field("backend", &self.backend)
            .field("rank", &self.group.rank())
            .field("world_size", &self.group.world_size())
            .finish()
    }
}

impl ProcessGroup for HostTransport {
    fn rank(&self) -> usize {
        self.group.rank()
    }

    fn world_size(&self) -> usize {
        self.group.world_size()
    }

    fn local_rank(&self) -> usize {
        self.group.local_rank()
    }
}

impl Transport for HostTransport {
    fn backend_name(&self) -> &'static str {
        self.backend
    }

    fn submit(&self, op: Collective) -> Result<PendingCollective> {
        op.validate(self.group.world_size())?;
        if let Some(tensor) = op.tensor() {
            let device = tensor.device();
            if !self.supports_device(device) {
                return Err(DistributedError::DeviceMismatch {
                    expected: "cpu".to_string(),
                    actual: format!("{:?}", device.location()),
                });
            }
            wire::dtype_code(tensor.dtype())?;
        }
        self.engine.submit(op)
    }

    fn shutdown(&self) -> Result<()> {
        self.engine.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::local::local_world;

    #[test]
    fn reduce_op_names() {
        assert_eq!(ReduceOp::Sum.to_string(), "sum");
        assert_eq!(ReduceOp::Average.as_str(), "average");
    }

    #[test]
    fn validate_rejects_out_of_range_root() {
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let op = Collective::Broadcast { tensor: t, root: 3 };
        assert!(matches!(
            op.validate(2),
            Err(DistributedError::InvalidRank {
                rank: 3,
                world_size: 2
            })
        ));
    }

    #[test]
    fn ready_handle_returns_value() {
        let t = Tensor::ones(3, DType::F32, &Device::Cpu).unwrap();
        let pending = PendingCollective::ready("broadcast", Ok(Some(t)));
        assert!(pending.is_ready());
        assert_eq!(pending.kind(), "broadcast");
        let out = pending.wait_tensor().unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn wait_tensor_on_empty_completion_fails() {
        let pending = PendingCollective::ready("reduce", Ok(None));
        assert!(matches!(
            pending.wait_tensor(),
            Err(DistributedError::Transport(_))
        ));
    }

    #[test]
    fn single_rank_collectives_are_identities() {
        let mut world = local_world(1).unwrap();
        let transport = world.pop().unwrap();
        let t = Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap();

        let reduced = transport.all_reduce(&t, ReduceOp::Sum).unwrap();
        assert_eq!(reduced.to_vec1::<f32>().unwrap(), vec![1., 2., 3.]);

        let bcast = transport.broadcast(&t, 0).unwrap();
        assert_eq!(bcast.to_vec1::<f32>().unwrap(), vec![1., 2., 3.]);

        transport.barrier().unwrap();
        transport.shutdown().unwrap();
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let transport = local_world(1).unwrap().pop().unwrap();
        transport.shutdown().unwrap();
        transport.shutdown().unwrap();
        assert!(matches!(
            transport.barrier(),
            Err(DistributedError::Transport(_))
        ));
    }
}
