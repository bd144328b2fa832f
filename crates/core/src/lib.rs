//! Collective coordination for synchronous data-parallel training.
//!
//! - [`distributed`]: process-group context, collectives over structured
//!   payloads, state synchronization and gradient aggregation.
//! - [`data`]: datasets and the per-rank contiguous partitioner.

pub mod data;
pub mod distributed;
