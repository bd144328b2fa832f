//! Collective operations over structured payloads.
//!
//! [`Communicator`] walks a [`Payload`] and issues one transport collective
//! per leaf, in the deterministic leaf order of the payload. Leaves resident
//! on an accelerator are staged through host memory unless the context is
//! accelerator-aware and the transport accepts the device.
//!
//! All ranks must call the same collectives, in the same order, with
//! structurally identical payloads. When structure verification is enabled a
//! fingerprint of the payload is compared across ranks first, so most
//! divergence is reported as [`DistributedError::StructureMismatch`] instead
//! of a hang. This is best-effort; it does not rule out deadlock.

use std::sync::Arc;

use candle_core::{Device, Tensor};

use super::context::{ProcessGroupContext, Session};
use super::error::{DistributedError, Result};
use super::payload::Payload;
use super::process_group::check_rank;
use super::transport::{Collective, PendingCollective, ReduceOp};

/// Per-leaf collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafOp {
    Broadcast { root: usize },
    AllReduce { op: ReduceOp },
    Reduce { op: ReduceOp, root: usize },
}

impl LeafOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Broadcast { .. } => "broadcast",
            Self::AllReduce { .. } => "all_reduce",
            Self::Reduce { .. } => "reduce",
        }
    }

    fn collective(&self, tensor: Tensor) -> Collective {
        match *self {
            Self::Broadcast { root } => Collective::Broadcast { tensor, root },
            Self::AllReduce { op } => Collective::AllReduce { tensor, op },
            Self::Reduce { op, root } => Collective::Reduce { tensor, op, root },
        }
    }
}

/// One in-flight leaf and where its result must end up.
#[derive(Debug)]
struct PendingLeaf {
    pending: PendingCollective,
    /// Original device when the leaf was staged through host memory.
    restore_to: Option<Device>,
}

/// Payload-level collective operations bound to a process-group context.
#[derive(Debug, Clone)]
pub struct Communicator {
    ctx: Arc<ProcessGroupContext>,
}

impl Communicator {
    pub fn new(ctx: Arc<ProcessGroupContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ProcessGroupContext> {
        &self.ctx
    }

    pub fn rank(&self) -> Result<usize> {
        self.ctx.rank()
    }

    pub fn world_size(&self) -> Result<usize> {
        self.ctx.world_size()
    }

    // ─── Blocking ───────────────────────────────────────────────────────

    /// Overwrite every leaf on non-root ranks with the root's value.
    pub fn broadcast(&self, payload: &mut Payload, root: usize) -> Result<()> {
        self.ibroadcast(payload, root)?.wait()
    }

    /// Broadcast a payload that the caller cannot mutate in place.
    ///
    /// Returns a payload of identical shape holding the root's values.
    pub fn broadcast_owned(&self, payload: Payload, root: usize) -> Result<Payload> {
        let mut payload = payload;
        self.broadcast(&mut payload, root)?;
        Ok(payload)
    }

    /// In-place element-wise reduction; every rank ends with the result.
    pub fn all_reduce(&self, payload: &mut Payload, op: ReduceOp) -> Result<()> {
        self.iall_reduce(payload, op)?.wait()
    }

    /// Element-wise reduction into `root`. Non-root payloads are left unchanged.
    pub fn reduce(&self, payload: &mut Payload, op: ReduceOp, root: usize) -> Result<()> {
        let session = self.ctx.session("reduce")?;
        check_rank(root, session.world_size())?;
        let leaves = self.launch(&session, payload, LeafOp::Reduce { op, root })?;
        complete(payload, leaves)
    }

    // ─── Non-blocking ───────────────────────────────────────────────────

    /// Start a broadcast. The payload stays borrowed until [`PendingPayload::wait`].
    pub fn ibroadcast<'a>(
        &self,
        payload: &'a mut Payload,
        root: usize,
    ) -> Result<PendingPayload<'a>> {
        let session = self.ctx.session("broadcast")?;
        check_rank(root, session.world_size())?;
        self.start(session, payload, LeafOp::Broadcast { root })
    }

    /// Start an all-reduce. The payload stays borrowed until [`PendingPayload::wait`].
    pub fn iall_reduce<'a>(
        &self,
        payload: &'a mut Payload,
        op: ReduceOp,
    ) -> Result<PendingPayload<'a>> {
        let session = self.ctx.session("all_reduce")?;
        self.start(session, payload, LeafOp::AllReduce { op })
    }

    fn start<'a>(
        &self,
        session: Arc<Session>,
        payload: &'a mut Payload,
        op: LeafOp,
    ) -> Result<PendingPayload<'a>> {
        let leaves = self.launch(&session, payload, op)?;
        Ok(PendingPayload {
            payload,
            leaves,
            op: op.name(),
        })
    }

    // ─── Tensor-level helpers ───────────────────────────────────────────

    /// All-reduce a single tensor, returning the result.
    pub fn all_reduce_tensor(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let mut payload = Payload::Tensor(tensor.clone());
        self.all_reduce(&mut payload, op)?;
        into_tensor(payload)
    }

    /// Broadcast a single tensor from `root`, returning the root's value.
    pub fn broadcast_tensor(&self, tensor: &Tensor, root: usize) -> Result<Tensor> {
        let payload = self.broadcast_owned(Payload::Tensor(tensor.clone()), root)?;
        into_tensor(payload)
    }

    /// Block until every rank reaches the barrier.
    pub fn barrier(&self) -> Result<()> {
        let session = self.ctx.session("barrier")?;
        if session.world_size() == 1 {
            return Ok(());
        }
        session.transport().barrier()
    }

    // ─── Internals ──────────────────────────────────────────────────────

    /// Verify structure, then submit one collective per leaf.
    fn launch(&self, session: &Session, payload: &Payload, op: LeafOp) -> Result<Vec<PendingLeaf>> {
        if session.world_size() == 1 {
            return Ok(Vec::new());
        }
        if session.verify_structure() {
            verify_structure(session, payload)?;
        }

        let transport = session.transport();
        let mut leaves = Vec::with_capacity(payload.leaf_count());
        payload.for_each_leaf(|path, leaf| {
            let Some(tensor) = leaf.leaf_tensor()? else {
                return Ok(());
            };
            let device = tensor.device().clone();
            let direct = device.is_cpu()
                || (session.accelerator_aware() && transport.supports_device(&device));
            let (input, restore_to) = if direct {
                (tensor, None)
            } else {
                (tensor.to_device(&Device::Cpu)?, Some(device))
            };
            tracing::trace!(
                leaf = path,
                collective = op.name(),
                staged = restore_to.is_some(),
                "Submitting leaf collective"
            );
            let pending = transport.submit(op.collective(input))?;
            leaves.push(PendingLeaf {
                pending,
                restore_to,
            });
            Ok(())
        })?;
        Ok(leaves)
    }
}

/// Wait for every leaf and write results back in leaf order.
///
/// Every handle is drained even after a failure; the first error wins.
fn complete(payload: &mut Payload, leaves: Vec<PendingLeaf>) -> Result<()> {
    if leaves.is_empty() {
        return Ok(());
    }
    let mut leaves = leaves.into_iter();
    let mut first_err: Option<DistributedError> = None;

    payload.for_each_leaf_mut(|path, leaf| {
        let Some(PendingLeaf {
            pending,
            restore_to,
        }) = leaves.next()
        else {
            return Ok(());
        };
        let result = pending.wait().and_then(|out| match out {
            Some(t) => {
                let t = match &restore_to {
                    Some(device) => t.to_device(device)?,
                    None => t,
                };
                leaf.set_leaf(t)
            }
            None => Ok(()),
        });
        if let Err(e) = result {
            tracing::debug!(leaf = path, error = %e, "Leaf collective failed");
            first_err.get_or_insert(e);
        }
        Ok(())
    })?;

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Compare the payload fingerprint across ranks with one max all-reduce.
///
/// Each rank contributes `[hi, lo, -hi, -lo]`; the maximum of the negated
/// halves is the negated minimum, so all four agree only when every rank
/// holds the same fingerprint.
fn verify_structure(session: &Session, payload: &Payload) -> Result<()> {
    let fingerprint = payload.fingerprint();
    let hi = (fingerprint >> 32) as i64;
    let lo = (fingerprint & 0xffff_ffff) as i64;
    let signature = Tensor::new(&[hi, lo, -hi, -lo], &Device::Cpu)?;
    let seen = session
        .transport()
        .all_reduce(&signature, ReduceOp::Max)?
        .to_vec1::<i64>()?;
    if seen != [hi, lo, -hi, -lo] {
        tracing::error!(
            rank = session.rank(),
            fingerprint = %format!("{fingerprint:#018x}"),
            "Payload structure differs across ranks"
        );
        return Err(DistributedError::StructureMismatch { fingerprint });
    }
    Ok(())
}

fn into_tensor(payload: Payload) -> Result<Tensor> {
    match payload {
        Payload::Tensor(t) => Ok(t),
        other => Err(DistributedError::Transport(format!(
            "expected a tensor payload, got {other:?}"
        ))),
    }
}

/// In-flight payload collective.
///
/// Holds the mutable borrow of the payload, so the buffer cannot be touched
/// until [`PendingPayload::wait`] returns. Dropping the handle without
/// waiting discards the results; the transport still completes the
/// operation so that peers are not left waiting.
#[must_use = "non-blocking collectives must be waited on"]
#[derive(Debug)]
pub struct PendingPayload<'a> {
    payload: &'a mut Payload,
    leaves: Vec<PendingLeaf>,
    op: &'static str,
}

impl PendingPayload<'_> {
    /// Number of leaf collectives still outstanding.
    pub fn outstanding(&self) -> usize {
        self.leaves.len()
    }

    /// Whether every leaf result is available without blocking.
    pub fn is_ready(&self) -> bool {
        self.leaves.iter().all(|leaf| leaf.pending.is_ready())
    }

    /// Block until every leaf completes and write results into the payload.
    pub fn wait(mut self) -> Result<()> {
        let leaves = std::mem::take(&mut self.leaves);
        complete(&mut *self.payload, leaves)
    }
}

impl Drop for PendingPayload<'_> {
    fn drop(&mut self) {
        if !self.leaves.is_empty() {
            tracing::warn!(
                collective = self.op,
                leaves = self.leaves.len(),
                "Non-blocking collective dropped without wait; results discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::context::{BackendKind, InitOptions};
    use candle_core::DType;

    fn single_rank() -> Communicator {
        let ctx = ProcessGroupContext::initialized(
            InitOptions::default().with_backend(BackendKind::Single),
        )
        .unwrap();
        Communicator::new(ctx)
    }

    #[test]
    fn collectives_fail_before_initialize() {
        let comm = Communicator::new(Arc::new(ProcessGroupContext::new()));
        let mut p = Payload::from(1.0f64);
        assert!(matches!(
            comm.all_reduce(&mut p, ReduceOp::Sum),
            Err(DistributedError::NotInitialized {
                operation: "all_reduce"
            })
        ));
        assert!(matches!(
            comm.broadcast(&mut p, 0),
            Err(DistributedError::NotInitialized { .. })
        ));
        assert!(comm.barrier().is_err());
    }

    #[test]
    fn single_rank_is_identity() {
        let comm = single_rank();
        let t = Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap();
        let mut p = Payload::map([("a", Payload::from(t)), ("b", Payload::from(4i64))]);

        comm.all_reduce(&mut p, ReduceOp::Average).unwrap();
        comm.broadcast(&mut p, 0).unwrap();
        comm.reduce(&mut p, ReduceOp::Product, 0).unwrap();
        comm.barrier().unwrap();

        match p.get("a") {
            Some(Payload::Tensor(t)) => assert_eq!(t.to_vec1::<f32>().unwrap(), vec![1., 2., 3.]),
            other => panic!("unexpected leaf {other:?}"),
        }
    }

    #[test]
    fn invalid_root_rejected() {
        let comm = single_rank();
        let mut p = Payload::from(0i64);
        assert!(matches!(
            comm.broadcast(&mut p, 1),
            Err(DistributedError::InvalidRank {
                rank: 1,
                world_size: 1
            })
        ));
        assert!(comm.reduce(&mut p, ReduceOp::Sum, 7).is_err());
    }

    #[test]
    fn tensor_helpers_on_single_rank() {
        let comm = single_rank();
        let t = Tensor::ones((2, 2), DType::F64, &Device::Cpu).unwrap();
        let r = comm.all_reduce_tensor(&t, ReduceOp::Sum).unwrap();
        assert_eq!(r.dims(), &[2, 2]);
        let b = comm.broadcast_tensor(&t, 0).unwrap();
        assert_eq!(b.sum_all().unwrap().to_scalar::<f64>().unwrap(), 4.0);
    }

    #[test]
    fn non_blocking_handle_on_single_rank() {
        let comm = single_rank();
        let mut p = Payload::from(2.0f64);
        let pending = comm.iall_reduce(&mut p, ReduceOp::Sum).unwrap();
        assert_eq!(pending.outstanding(), 0);
        assert!(pending.is_ready());
        pending.wait().unwrap();
        assert!(matches!(p, Payload::Scalar(_)));
    }
}
