//! Gradient aggregation.
//!
//! Gradients are summed across ranks, not averaged. Callers that want the
//! mean gradient scale the loss or the learning rate by the world size.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, VarMap};

use super::communicator::Communicator;
use super::error::Result;
use super::payload::Payload;
use super::transport::ReduceOp;

/// Sum every leaf of `grads` across all ranks, in place.
pub fn allreduce_gradients(comm: &Communicator, grads: &mut Payload) -> Result<()> {
    comm.all_reduce(grads, ReduceOp::Sum)
}

/// Sum the gradient of each `Var` across ranks, in `vars` order.
///
/// A `Var` with no gradient on this rank is represented by an empty marker,
/// so ranks that disagree on which parameters received gradients are caught
/// by structure verification rather than mixing unrelated buffers.
pub fn allreduce_grad_store(comm: &Communicator, grads: &mut GradStore, vars: &[Var]) -> Result<()> {
    let mut payload = Payload::List(
        vars.iter()
            .map(|var| match grads.get(var.as_tensor()) {
                Some(g) => Payload::Tensor(g.clone()),
                None => Payload::empty(),
            })
            .collect(),
    );
    allreduce_gradients(comm, &mut payload)?;

    if let Payload::List(reduced) = payload {
        for (var, grad) in vars.iter().zip(reduced) {
            if let Payload::Tensor(g) = grad {
                grads.insert(var.as_tensor(), g);
            }
        }
    }
    Ok(())
}

/// Wrap a training step so the gradients it returns are already summed.
///
/// ```ignore
/// let mut step = reduce_gradients_after(&comm, |batch: &Batch| compute_grads(batch));
/// let grads = step(&batch)?;
/// ```
pub fn reduce_gradients_after<'a, A, F>(
    comm: &'a Communicator,
    mut step: F,
) -> impl FnMut(A) -> Result<Payload> + 'a
where
    F: FnMut(A) -> Result<Payload> + 'a,
{
    move |input| {
        let mut grads = step(input)?;
        allreduce_gradients(comm, &mut grads)?;
        Ok(grads)
    }
}

/// Parameters of `var_map` in ascending name order.
pub fn sorted_vars(var_map: &VarMap) -> Vec<Var> {
    let data = var_map.data().lock().unwrap_or_else(|e| e.into_inner());
    let mut named: Vec<_> = data.iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    named.into_iter().map(|(_, var)| var.clone()).collect()
}

/// Optimizer wrapper that sums gradients across ranks before every update.
///
/// Replicas stay identical as long as their parameters were synchronized
/// before the first step and every rank performs the same sequence of steps.
pub struct DistributedOptimizer<O: Optimizer> {
    base: O,
    vars: Vec<Var>,
    comm: Communicator,
}

impl<O: Optimizer> DistributedOptimizer<O> {
    /// Wrap an existing optimizer that updates `vars`.
    pub fn new(base: O, vars: Vec<Var>, comm: Communicator) -> Self {
        Self { base, vars, comm }
    }

    /// Build the base optimizer over `vars` and wrap it.
    pub fn from_vars(vars: Vec<Var>, config: O::Config, comm: Communicator) -> Result<Self> {
        let base = O::new(vars.clone(), config)?;
        Ok(Self::new(base, vars, comm))
    }

    /// Wrap every parameter of `var_map`, ordered by name.
    ///
    /// `VarMap::all_vars` follows hash order, which differs between
    /// processes; gradient reduction needs the same order on every rank.
    pub fn from_var_map(var_map: &VarMap, config: O::Config, comm: Communicator) -> Result<Self> {
        Self::from_vars(sorted_vars(var_map), config, comm)
    }

    /// Sum `grads` across ranks, then apply the base update rule.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        allreduce_grad_store(&self.comm, grads, &self.vars)?;
        self.base.step(grads)?;
        Ok(())
    }

    /// Backpropagate `loss`, then [`DistributedOptimizer::step`].
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let mut grads = loss.backward()?;
        self.step(&mut grads)
    }

    pub fn learning_rate(&self) -> f64 {
        self.base.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.base.set_learning_rate(lr)
    }

    pub fn base(&self) -> &O {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut O {
        &mut self.base
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }

    pub fn into_inner(self) -> O {
        self.base
    }
}
