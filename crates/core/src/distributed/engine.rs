//! Progress engine shared by the host transports.
//!
//! Each rank owns one progress thread that executes collectives strictly in
//! submission order over a set of point-to-point [`Links`]. Reductions are
//! gathered at a single rank and combined in ascending rank order, so the
//! result for a fixed world size does not depend on message timing.

use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use candle_core::{DType, Device, Tensor};
use crossbeam_channel::{unbounded, Sender};

use super::error::{DistributedError, Result};
use super::transport::{Collective, Completion, PendingCollective, ReduceOp};
use super::wire::{self, OpTag};

/// Ordered point-to-point byte channels to every peer.
///
/// Messages between a given pair of ranks must be delivered in order.
pub trait Links: Send + 'static {
    fn send_to(&mut self, peer: usize, frame: Vec<u8>) -> Result<()>;
    fn recv_from(&mut self, peer: usize) -> Result<Vec<u8>>;
}

type Job = (Collective, Sender<Completion>);

/// Handle to a rank's progress thread.
pub(crate) struct Engine {
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub(crate) fn spawn<L: Links>(rank: usize, world_size: usize, links: L) -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let worker = thread::Builder::new()
            .name(format!("dpsync-progress-{rank}"))
            .spawn(move || {
                let mut exec = Executor {
                    rank,
                    world_size,
                    links,
                    poisoned: None,
                };
                for (op, done) in rx.iter() {
                    let result = exec.run(op);
                    // The caller may have dropped its handle; the work is done either way.
                    let _ = done.send(result);
                }
                tracing::trace!(rank, "Progress thread exiting");
            })?;

        Ok(Self {
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn submit(&self, op: Collective) -> Result<PendingCollective> {
        let (done, pending) = PendingCollective::channel(op.name());
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let sender = jobs
            .as_ref()
            .ok_or_else(|| DistributedError::Transport("transport has been shut down".into()))?;
        sender
            .send((op, done))
            .map_err(|_| DistributedError::Transport("progress thread has exited".into()))?;
        Ok(pending)
    }

    /// Close the job queue and join the progress thread after it drains.
    pub(crate) fn shutdown(&self) -> Result<()> {
        drop(self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take());
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| DistributedError::Transport("progress thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Transport shutdown failed during drop");
        }
    }
}

struct Executor<L> {
    rank: usize,
    world_size: usize,
    links: L,
    /// Set after the first failure; the peer state is unknown from then on.
    poisoned: Option<String>,
}

impl<L: Links> Executor<L> {
    fn run(&mut self, op: Collective) -> Completion {
        if let Some(reason) = &self.poisoned {
            return Err(DistributedError::Transport(format!(
                "transport unusable after earlier failure: {reason}"
            )));
        }
        let name = op.name();
        let result = self.execute(op);
        if let Err(e) = &result {
            tracing::error!(
                rank = self.rank,
                collective = name,
                error = %e,
                "Collective failed; transport is now poisoned"
            );
            self.poisoned = Some(e.to_string());
        }
        result
    }

    fn execute(&mut self, op: Collective) -> Completion {
        match op {
            Collective::Broadcast { tensor, root } => {
                self.broadcast(OpTag::Broadcast, tensor, root).map(Some)
            }
            Collective::AllReduce { tensor, op } => self.all_reduce(tensor, op).map(Some),
            Collective::Reduce { tensor, op, root } => {
                self.reduce(OpTag::Reduce, tensor, op, root)
            }
            Collective::Send { tensor, dst } => {
                let frame = wire::encode(OpTag::Send, &tensor)?;
                self.links.send_to(dst, frame)?;
                Ok(None)
            }
            Collective::Recv { src, shape, dtype } => {
                let frame = self.links.recv_from(src)?;
                wire::decode(&frame, OpTag::Send, dtype, &shape, &Device::Cpu).map(Some)
            }
            Collective::Barrier => {
                let token = Tensor::zeros(1, DType::U8, &Device::Cpu)?;
                self.reduce(OpTag::Barrier, token.clone(), ReduceOp::Max, 0)?;
                self.broadcast(OpTag::Barrier, token, 0)?;
                Ok(None)
            }
        }
    }

    fn broadcast(&mut self, tag: OpTag, tensor: Tensor, root: usize) -> Result<Tensor> {
        if self.rank == root {
            let frame = wire::encode(tag, &tensor)?;
            for peer in (0..self.world_size).filter(|&p| p != root) {
                self.links.send_to(peer, frame.clone())?;
            }
            Ok(tensor)
        } else {
            let frame = self.links.recv_from(root)?;
            wire::decode(
                &frame,
                tag,
                tensor.dtype(),
                tensor.dims(),
                tensor.device(),
            )
        }
    }

    /// Gather every rank's tensor at `root` and fold in ascending rank order.
    fn reduce(
        &mut self,
        tag: OpTag,
        tensor: Tensor,
        op: ReduceOp,
        root: usize,
    ) -> Result<Option<Tensor>> {
        if self.rank != root {
            let frame = wire::encode(tag, &tensor)?;
            self.links.send_to(root, frame)?;
            return Ok(None);
        }

        let mut acc: Option<Tensor> = None;
        for peer in 0..self.world_size {
            let contribution = if peer == self.rank {
                tensor.clone()
            } else {
                let frame = self.links.recv_from(peer)?;
                wire::decode(
                    &frame,
                    tag,
                    tensor.dtype(),
                    tensor.dims(),
                    tensor.device(),
                )?
            };
            acc = Some(match acc {
                None => contribution,
                Some(acc) => combine(&acc, &contribution, op)?,
            });
        }

        let mut reduced = acc.unwrap_or(tensor);
        if op == ReduceOp::Average {
            reduced = average(&reduced, self.world_size)?;
        }
        Ok(Some(reduced))
    }

    fn all_reduce(&mut self, tensor: Tensor, op: ReduceOp) -> Result<Tensor> {
        let reduced = self.reduce(OpTag::AllReduce, tensor.clone(), op, 0)?;
        self.broadcast(OpTag::AllReduce, reduced.unwrap_or(tensor), 0)
    }
}

fn combine(acc: &Tensor, other: &Tensor, op: ReduceOp) -> Result<Tensor> {
    let out = match op {
        ReduceOp::Sum | ReduceOp::Average => acc.add(other)?,
        ReduceOp::Product => acc.mul(other)?,
        ReduceOp::Min => acc.minimum(other)?,
        ReduceOp::Max => acc.maximum(other)?,
    };
    Ok(out)
}

/// Divide a sum by the world size. Integer sums are divided in f64 and
/// truncated back to their dtype.
fn average(sum: &Tensor, world_size: usize) -> Result<Tensor> {
    let scale = 1.0 / world_size as f64;
    let out = if sum.dtype().is_int() {
        sum.to_dtype(DType::F64)?
            .affine(scale, 0.0)?
            .to_dtype(sum.dtype())?
    } else {
        sum.affine(scale, 0.0)?
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_applies_each_op() {
        let a = Tensor::new(&[1f32, 5., -2.], &Device::Cpu).unwrap();
        let b = Tensor::new(&[3f32, 2., 4.], &Device::Cpu).unwrap();
        let v = |op| combine(&a, &b, op).unwrap().to_vec1::<f32>().unwrap();

        assert_eq!(v(ReduceOp::Sum), vec![4., 7., 2.]);
        assert_eq!(v(ReduceOp::Product), vec![3., 10., -8.]);
        assert_eq!(v(ReduceOp::Min), vec![1., 2., -2.]);
        assert_eq!(v(ReduceOp::Max), vec![3., 5., 4.]);
    }

    #[test]
    fn integer_average_divides_in_float() {
        let sum = Tensor::new(&[10i64, 7, -9], &Device::Cpu).unwrap();
        let avg = average(&sum, 4).unwrap();
        assert_eq!(avg.dtype(), DType::I64);
        assert_eq!(avg.to_vec1::<i64>().unwrap(), vec![2, 1, -2]);

        let sum = Tensor::new(&[10f32, 1.], &Device::Cpu).unwrap();
        assert_eq!(
            average(&sum, 4).unwrap().to_vec1::<f32>().unwrap(),
            vec![2.5, 0.25]
        );
    }

    /// Links that fail every operation.
    struct BrokenLinks;

    impl Links for BrokenLinks {
        fn send_to(&mut self, peer: usize, _frame: Vec<u8>) -> Result<()> {
            Err(DistributedError::Transport(format!("no route to rank {peer}")))
        }

        fn recv_from(&mut self, peer: usize) -> Result<Vec<u8>> {
            Err(DistributedError::Transport(format!("no route to rank {peer}")))
        }
    }

    #[test]
    fn failure_poisons_later_operations() {
        let engine = Engine::spawn(0, 2, BrokenLinks).unwrap();
        let t = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();

        let first = engine
            .submit(Collective::Broadcast {
                tensor: t.clone(),
                root: 0,
            })
            .unwrap()
            .wait();
        assert!(first.unwrap_err().to_string().contains("no route to rank 1"));

        let second = engine.submit(Collective::Barrier).unwrap().wait();
        assert!(second
            .unwrap_err()
            .to_string()
            .contains("unusable after earlier failure"));

        engine.shutdown().unwrap();
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let engine = Engine::spawn(0, 1, BrokenLinks).unwrap();
        engine.shutdown().unwrap();
        assert!(engine.submit(Collective::Barrier).is_err());
    }
}
