//! In-process transport: threads as ranks.
//!
//! Every ordered pair of ranks gets its own unbounded channel, so a world of
//! `n` ranks uses an `n x n` matrix of links. This is used for simulation and
//! for multi-rank tests without sockets or child processes.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::context::{InitOptions, ProcessGroupContext};
use super::engine::Links;
use super::error::{DistributedError, Result};
use super::process_group::{ProcessGroup, StaticProcessGroup};
use super::transport::{HostTransport, Transport};

/// Channel links of one rank to every peer (including an unused self-link).
pub struct LocalLinks {
    rank: usize,
    to_peer: Vec<Sender<Vec<u8>>>,
    from_peer: Vec<Receiver<Vec<u8>>>,
}

impl Links for LocalLinks {
    fn send_to(&mut self, peer: usize, frame: Vec<u8>) -> Result<()> {
        let tx = self.to_peer.get(peer).ok_or(DistributedError::InvalidRank {
            rank: peer,
            world_size: self.to_peer.len(),
        })?;
        tx.send(frame).map_err(|_| {
            DistributedError::Transport(format!(
                "rank {} cannot reach rank {peer}: peer transport is gone",
                self.rank
            ))
        })
    }

    fn recv_from(&mut self, peer: usize) -> Result<Vec<u8>> {
        let rx = self.from_peer.get(peer).ok_or(DistributedError::InvalidRank {
            rank: peer,
            world_size: self.from_peer.len(),
        })?;
        rx.recv().map_err(|_| {
            DistributedError::Transport(format!(
                "rank {} lost rank {peer} while waiting for data",
                self.rank
            ))
        })
    }
}

/// Build the links for every rank of an in-process world.
pub fn local_links(world_size: usize) -> Result<Vec<LocalLinks>> {
    if world_size == 0 {
        return Err(DistributedError::InvalidWorldSize(world_size));
    }

    // channels[src][dst] carries messages from src to dst.
    let mut senders: Vec<Vec<Sender<Vec<u8>>>> = Vec::with_capacity(world_size);
    let mut receivers: Vec<Vec<Option<Receiver<Vec<u8>>>>> = (0..world_size)
        .map(|_| (0..world_size).map(|_| None).collect())
        .collect();
    for src in 0..world_size {
        let mut row = Vec::with_capacity(world_size);
        for dst_receivers in receivers.iter_mut() {
            let (tx, rx) = unbounded();
            row.push(tx);
            dst_receivers[src] = Some(rx);
        }
        senders.push(row);
    }

    senders
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(rank, (to_peer, from_peer))| {
            let from_peer = from_peer
                .into_iter()
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    DistributedError::Initialization(format!(
                        "incomplete link matrix for rank {rank}"
                    ))
                })?;
            Ok(LocalLinks {
                rank,
                to_peer,
                from_peer,
            })
        })
        .collect()
}

/// Create one transport per rank of an in-process world, in rank order.
pub fn local_world(world_size: usize) -> Result<Vec<HostTransport>> {
    local_links(world_size)?
        .into_iter()
        .enumerate()
        .map(|(rank, links)| {
            HostTransport::new(StaticProcessGroup::new(rank, world_size)?, "local", links)
        })
        .collect()
}

/// Run `f` once per rank on its own thread, each with an initialized context.
///
/// Results are returned in rank order. Contexts are finalized after `f`
/// returns. A panic on any rank is propagated to the caller.
pub fn run_local_world<F, T>(world_size: usize, options: InitOptions, f: F) -> Result<Vec<T>>
where
    F: Fn(Arc<ProcessGroupContext>) -> T + Sync,
    T: Send,
{
    let transports = local_world(world_size)?;
    let f = &f;

    thread::scope(|scope| {
        let handles: Vec<_> = transports
            .into_iter()
            .map(|transport| {
                let options = options.clone();
                let rank = transport.rank();
                thread::Builder::new()
                    .name(format!("dpsync-rank-{rank}"))
                    .spawn_scoped(scope, move || -> Result<T> {
                        let ctx = Arc::new(ProcessGroupContext::new());
                        let transport: Arc<dyn Transport> = Arc::new(transport);
                        ctx.initialize_with_transport(transport, options)?;
                        let out = f(Arc::clone(&ctx));
                        ctx.finalize()?;
                        Ok(out)
                    })
            })
            .collect::<std::io::Result<_>>()?;

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}
