//! Indexable datasets and per-rank partitioning.
//!
//! - [`Dataset`]: length-aware random access to samples.
//! - [`partition`]: the contiguous index range assigned to a rank.
//! - [`PartitionedDataset`]: a dataset view restricted to that range.

mod partition;

pub use partition::{partition, PartitionIndexSet, PartitionedDataset};

/// Random access to a collection of samples.
pub trait Dataset: Send + Sync {
    type Item;

    /// Total number of samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `index`, or `None` when out of range.
    fn get(&self, index: usize) -> Option<Self::Item>;
}

impl<T: Clone + Send + Sync> Dataset for Vec<T> {
    type Item = T;

    fn len(&self) -> usize {
        <[T]>::len(self)
    }

    fn get(&self, index: usize) -> Option<T> {
        <[T]>::get(self, index).cloned()
    }
}

impl<D: Dataset + ?Sized> Dataset for std::sync::Arc<D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Option<Self::Item> {
        (**self).get(index)
    }
}
