//! Linear-regression worker: one replica of a data-parallel training run.
//!
//! Run under `dpsync-launch`, or alone with `DPSYNC_BACKEND=single`.

use anyhow::Context;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, VarBuilder, VarMap, SGD};
use clap::Parser;
use dpsync_core::data::{Dataset, PartitionedDataset};
use dpsync_core::distributed::{
    sorted_vars, synchronize_var_map, Communicator, DistributedOptimizer, InitOptions, Payload,
    ProcessGroupContext, ReduceOp, Scalar,
};
use dpsync_core::{all_println, rank0_println};
use dpsync_launch::logging;

#[derive(Parser)]
#[command(name = "dpsync-demo", about = "Data-parallel linear regression")]
struct Args {
    /// Number of passes over the dataset
    #[arg(long, default_value_t = 50)]
    epochs: usize,

    /// Learning rate of the global (summed) gradient, before world-size scaling
    #[arg(long, default_value_t = 0.5)]
    lr: f64,

    /// Size of the synthetic dataset
    #[arg(long, default_value_t = 64)]
    samples: usize,
}

/// Samples of `y = 2 x0 - 3 x1 + 0.5` on a fixed grid.
fn synthetic(samples: usize) -> Vec<([f32; 2], f32)> {
    let n = samples.max(1) as f32;
    (0..samples)
        .map(|i| {
            let x0 = i as f32 / n;
            let x1 = ((i * 7) % samples.max(1)) as f32 / n;
            ([x0, x1], 2.0 * x0 - 3.0 * x1 + 0.5)
        })
        .collect()
}

fn to_batch(shard: &PartitionedDataset<Vec<([f32; 2], f32)>>) -> anyhow::Result<(Tensor, Tensor)> {
    let n = shard.len();
    let mut xs = Vec::with_capacity(n * 2);
    let mut ys = Vec::with_capacity(n);
    for (x, y) in shard.iter() {
        xs.extend_from_slice(&x);
        ys.push(y);
    }
    Ok((
        Tensor::from_vec(xs, (n, 2), &Device::Cpu)?,
        Tensor::from_vec(ys, (n, 1), &Device::Cpu)?,
    ))
}

fn flat_params(var_map: &VarMap) -> anyhow::Result<Tensor> {
    let parts = sorted_vars(var_map)
        .iter()
        .map(|v| v.as_tensor().flatten_all())
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&parts, 0)?)
}

fn train(ctx: &ProcessGroupContext, comm: &Communicator, args: &Args) -> anyhow::Result<()> {
    let world_size = ctx.world_size()?;

    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
    let model = linear(2, 1, vb.pp("fc"))?;
    synchronize_var_map(comm, &var_map, 0)?;

    let shard = PartitionedDataset::new(synthetic(args.samples), ctx)?;
    tracing::info!(
        rank = ctx.rank()?,
        samples = shard.len(),
        range = ?shard.indices().range(),
        "training shard"
    );
    anyhow::ensure!(!shard.is_empty(), "empty training shard; use fewer processes");
    let (x, y) = to_batch(&shard)?;

    let mut opt = DistributedOptimizer::<SGD>::from_var_map(
        &var_map,
        args.lr / world_size as f64,
        comm.clone(),
    )?;

    for epoch in 0..args.epochs {
        let loss = candle_nn::loss::mse(&model.forward(&x)?, &y)?;
        opt.backward_step(&loss)?;

        let mut mean_loss = Payload::from(loss.to_scalar::<f32>()? as f64);
        comm.all_reduce(&mut mean_loss, ReduceOp::Average)?;
        if let Payload::Scalar(Scalar::F64(value)) = mean_loss {
            if epoch % 10 == 0 || epoch + 1 == args.epochs {
                rank0_println!(ctx, "epoch {epoch} loss {value:.6}");
            }
        }
    }

    let local = flat_params(&var_map)?;
    let reference = comm.broadcast_tensor(&local, 0)?;
    let local = local.to_vec1::<f32>()?;
    anyhow::ensure!(
        local == reference.to_vec1::<f32>()?,
        "replica diverged from rank 0"
    );
    all_println!(ctx, "final params {local:?}");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init()?;

    let options = InitOptions::from_env().context("invalid DPSYNC_* settings")?;
    let ctx = ProcessGroupContext::initialized(options)?;
    let comm = Communicator::new(ctx.clone());

    let result = train(&ctx, &comm, &args);
    if let Err(e) = &result {
        tracing::error!(error = %e, "training failed");
    }
    ctx.finalize()?;
    result
}
