use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dpsync_core::distributed::BackendKind;
use dpsync_launch::logging::{self, LogFormat};
use dpsync_launch::{LaunchConfig, LaunchPlan};

#[derive(Parser)]
#[command(
    name = "dpsync-launch",
    about = "Start data-parallel workers on this host",
    trailing_var_arg = true
)]
struct Cli {
    /// Number of worker processes
    #[arg(long)]
    nproc_per_node: Option<usize>,

    /// Address rank 0 listens on
    #[arg(long)]
    master_addr: Option<String>,

    /// Port rank 0 listens on
    #[arg(long)]
    master_port: Option<u16>,

    /// Transport backend (tcp, single)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Stage all collectives through host memory
    #[arg(long)]
    disable_accelerator_aware: bool,

    /// Launch settings file (TOML); CLI flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Worker program followed by its arguments
    #[arg(required = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

impl Cli {
    fn overrides(&self) -> LaunchConfig {
        LaunchConfig {
            nproc_per_node: self.nproc_per_node,
            master_addr: self.master_addr.clone(),
            master_port: self.master_port,
            backend: self.backend,
            disable_accelerator_aware: self.disable_accelerator_aware.then_some(true),
            log_level: self.log_level.clone(),
            ..Default::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LaunchConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => LaunchConfig::default(),
    };
    config.merge(&cli.overrides());

    logging::init_with_level_and_format(config.log_level(), LogFormat::from_env())?;
    if let Some(path) = &cli.config {
        tracing::info!(path = %path.display(), "loaded launch config");
    }

    let mut command = cli.command.into_iter();
    let program = command.next().context("missing worker program")?;
    let plan = LaunchPlan::new(&config, program, command.collect())?;
    tracing::info!(
        nproc_per_node = plan.nproc_per_node,
        backend = %plan.backend,
        master = %format!("{}:{}", plan.master_addr, plan.master_port),
        program = %plan.program.to_string_lossy(),
        "launching workers"
    );

    let code = plan.run()?;
    if code != 0 {
        tracing::error!(code, "worker group failed");
        std::process::exit(code);
    }
    Ok(())
}
