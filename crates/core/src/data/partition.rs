//! Equal contiguous partitioning of a dataset across ranks.
//!
//! With `chunk = ceil(len / world_size)`, rank `r` owns indices
//! `[r * chunk, min((r + 1) * chunk, len))`. Because the chunk size is
//! rounded up, the last non-empty shard may be short and trailing ranks may
//! receive nothing at all (e.g. 2 samples over 5 ranks gives ranks 2..4 an
//! empty shard).

use std::ops::Range;

use super::Dataset;
use crate::distributed::{DistributedError, ProcessGroupContext, Result};

/// Indices assigned to one rank. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionIndexSet {
    total_len: usize,
    world_size: usize,
    rank: usize,
    chunk_size: usize,
    range: Range<usize>,
}

/// Compute the shard of `total_len` indices owned by `rank`.
pub fn partition(total_len: usize, world_size: usize, rank: usize) -> Result<PartitionIndexSet> {
    if world_size == 0 {
        return Err(DistributedError::InvalidWorldSize(world_size));
    }
    if rank >= world_size {
        return Err(DistributedError::InvalidRank { rank, world_size });
    }

    let chunk_size = total_len.div_ceil(world_size);
    let start = rank.saturating_mul(chunk_size).min(total_len);
    let end = start.saturating_add(chunk_size).min(total_len);

    Ok(PartitionIndexSet {
        total_len,
        world_size,
        rank,
        chunk_size,
        range: start..end,
    })
}

impl PartitionIndexSet {
    /// Number of indices assigned to this rank.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// The `i`-th assigned index in the full dataset's indexing.
    pub fn get(&self, i: usize) -> Option<usize> {
        (i < self.len()).then(|| self.range.start + i)
    }

    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn iter(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.iter().collect()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of non-empty chunks the dataset is split into.
    pub fn num_chunks(&self) -> usize {
        if self.chunk_size == 0 {
            0
        } else {
            self.total_len.div_ceil(self.chunk_size)
        }
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

impl IntoIterator for &PartitionIndexSet {
    type Item = usize;
    type IntoIter = Range<usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A dataset restricted to the shard of one rank.
#[derive(Debug, Clone)]
pub struct PartitionedDataset<D> {
    inner: D,
    indices: PartitionIndexSet,
}

impl<D: Dataset> PartitionedDataset<D> {
    /// Shard `inner` for the rank and world size of an initialized context.
    pub fn new(inner: D, ctx: &ProcessGroupContext) -> Result<Self> {
        let rank = ctx.rank()?;
        let world_size = ctx.world_size()?;
        Self::with_partition(inner, world_size, rank)
    }

    /// Shard `inner` for an explicit `(world_size, rank)`.
    pub fn with_partition(inner: D, world_size: usize, rank: usize) -> Result<Self> {
        let indices = partition(inner.len(), world_size, rank)?;
        if indices.is_empty() {
            tracing::warn!(
                rank,
                world_size,
                total_len = indices.total_len(),
                "Rank received an empty data partition"
            );
        } else {
            tracing::debug!(
                rank,
                world_size,
                start = indices.range.start,
                end = indices.range.end,
                "Data partition assigned"
            );
        }
        Ok(Self { inner, indices })
    }

    pub fn indices(&self) -> &PartitionIndexSet {
        &self.indices
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Like [`Dataset::get`], but reports out-of-range access as an error.
    pub fn try_get(&self, index: usize) -> Result<D::Item> {
        let len = self.indices.len();
        self.get(index)
            .ok_or(DistributedError::IndexOutOfRange { index, len })
    }

    /// Samples of this shard in order.
    pub fn iter(&self) -> impl Iterator<Item = D::Item> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

impl<D: Dataset> Dataset for PartitionedDataset<D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> Option<D::Item> {
        self.indices.get(index).and_then(|i| self.inner.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_over_three() {
        let shards: Vec<_> = (0..3).map(|r| partition(10, 3, r).unwrap()).collect();
        assert!(shards.iter().all(|s| s.chunk_size() == 4));
        assert_eq!(shards[0].indices(), vec![0, 1, 2, 3]);
        assert_eq!(shards[1].indices(), vec![4, 5, 6, 7]);
        assert_eq!(shards[2].indices(), vec![8, 9]);
        assert_eq!(shards[0].num_chunks(), 3);
    }

    #[test]
    fn two_over_five_leaves_trailing_ranks_empty() {
        let lens: Vec<_> = (0..5).map(|r| partition(2, 5, r).unwrap().len()).collect();
        assert_eq!(lens, vec![1, 1, 0, 0, 0]);
        assert_eq!(partition(2, 5, 1).unwrap().get(0), Some(1));
        assert_eq!(partition(2, 5, 4).unwrap().get(0), None);
    }

    #[test]
    fn empty_dataset() {
        let p = partition(0, 4, 3).unwrap();
        assert_eq!(p.chunk_size(), 0);
        assert!(p.is_empty());
        assert_eq!(p.num_chunks(), 0);
    }

    #[test]
    fn invalid_arguments() {
        assert!(matches!(
            partition(10, 0, 0),
            Err(DistributedError::InvalidWorldSize(0))
        ));
        assert!(matches!(
            partition(10, 2, 2),
            Err(DistributedError::InvalidRank {
                rank: 2,
                world_size: 2
            })
        ));
    }

    #[test]
    fn partitioned_view_maps_indices() {
        let data: Vec<char> = "abcdefghij".chars().collect();
        let shard = PartitionedDataset::with_partition(data, 3, 1).unwrap();
        assert_eq!(shard.len(), 4);
        assert_eq!(shard.get(0), Some('e'));
        assert_eq!(shard.get(3), Some('h'));
        assert_eq!(shard.get(4), None);
        assert_eq!(shard.iter().collect::<String>(), "efgh");
    }

    #[test]
    fn try_get_reports_out_of_range() {
        let shard = PartitionedDataset::with_partition(vec![1, 2, 3], 2, 1).unwrap();
        assert_eq!(shard.try_get(0).unwrap(), 3);
        assert!(matches!(
            shard.try_get(1),
            Err(DistributedError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn view_requires_initialized_context() {
        let ctx = ProcessGroupContext::new();
        let err = PartitionedDataset::new(vec![1u8; 4], &ctx).unwrap_err();
        assert!(matches!(err, DistributedError::NotInitialized { .. }));
    }
}
