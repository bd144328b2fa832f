//! Initial state synchronization.
//!
//! Replicas start from independent random initialization; broadcasting every
//! leaf from the root makes them byte-identical before training begins.

use candle_core::Var;
use candle_nn::VarMap;

use super::communicator::Communicator;
use super::error::Result;
use super::payload::Payload;

/// Broadcast every leaf of `payload` from `root`.
///
/// All ranks must call this with structurally identical payloads, in the
/// same order relative to other collectives.
pub fn synchronize(comm: &Communicator, payload: &mut Payload, root: usize) -> Result<()> {
    let leaves = payload.leaf_count();
    comm.broadcast(payload, root)?;
    tracing::debug!(root, leaves, "Synchronized payload");
    Ok(())
}

/// Broadcast a list of parameters in place.
pub fn synchronize_vars(comm: &Communicator, vars: &[Var], root: usize) -> Result<()> {
    let mut payload = Payload::from_vars(vars);
    synchronize(comm, &mut payload, root)
}

/// Broadcast every parameter of a [`VarMap`] in place, in sorted name order.
pub fn synchronize_var_map(comm: &Communicator, var_map: &VarMap, root: usize) -> Result<()> {
    let mut payload = Payload::from_var_map(var_map);
    let count = payload.leaf_count();
    synchronize(comm, &mut payload, root)?;
    tracing::info!(root, parameters = count, "Model parameters synchronized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::context::{BackendKind, InitOptions, ProcessGroupContext};
    use candle_core::{DType, Device};

    #[test]
    fn single_rank_synchronize_keeps_values() {
        let ctx = ProcessGroupContext::initialized(
            InitOptions::default().with_backend(BackendKind::Single),
        )
        .unwrap();
        let comm = Communicator::new(ctx);
        let var = Var::ones(3, DType::F32, &Device::Cpu).unwrap();
        synchronize_vars(&comm, &[var.clone()], 0).unwrap();
        assert_eq!(var.to_vec1::<f32>().unwrap(), vec![1., 1., 1.]);
    }

    #[test]
    fn synchronize_requires_initialization() {
        let comm = Communicator::new(std::sync::Arc::new(ProcessGroupContext::new()));
        let var_map = VarMap::new();
        assert!(synchronize_var_map(&comm, &var_map, 0).is_err());
    }
}
