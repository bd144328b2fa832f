//! Process group abstractions.
//!
//! A process group is the fixed set of worker processes that participate in
//! collective operations. Every worker holds a full model replica and is
//! identified by its rank in `0..world_size`.

use super::error::{DistributedError, Result};

/// Trait for process group implementations.
pub trait ProcessGroup: Send + Sync {
    /// Global rank of this process (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the group.
    fn world_size(&self) -> usize;

    /// Local rank on this node (for multi-node setups).
    fn local_rank(&self) -> usize;

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-process group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Fixed rank assignment, validated on construction.
///
/// Transports embed one of these and delegate their [`ProcessGroup`]
/// implementation to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticProcessGroup {
    rank: usize,
    world_size: usize,
    local_rank: usize,
}

impl StaticProcessGroup {
    /// Group with a single member (rank 0 of 1).
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }

    /// Create a group membership; `local_rank` defaults to `rank`.
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        Self::with_local_rank(rank, world_size, rank)
    }

    pub fn with_local_rank(rank: usize, world_size: usize, local_rank: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(DistributedError::InvalidWorldSize(world_size));
        }
        check_rank(rank, world_size)?;
        Ok(Self {
            rank,
            world_size,
            local_rank,
        })
    }
}

impl Default for StaticProcessGroup {
    fn default() -> Self {
        Self::single()
    }
}

impl ProcessGroup for StaticProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }
}

/// Fails with [`DistributedError::InvalidRank`] unless `rank < world_size`.
pub fn check_rank(rank: usize, world_size: usize) -> Result<()> {
    if rank >= world_size {
        return Err(DistributedError::InvalidRank { rank, world_size });
    }
    Ok(())
}
