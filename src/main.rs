use std::{env, path::Path, sync::Arc};

use anyhow::Context;
use comms::{DistEnv, Solo};
use log::{info, warn};
use machine_learning::data::InMemoryProvider;
use yolox_exp::{Exp, ExpConfig};

/// Prints the resolved experiment and what it builds.
///
/// Usage: `yolox-exp [config.json] [key value]...`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args: Vec<String> = env::args().skip(1).collect();

    let config = match args.first() {
        Some(first) if first.ends_with(".json") => {
            let path = args.remove(0);
            ExpConfig::from_json_file(Path::new(&path))
                .with_context(|| format!("loading {path}"))?
        }
        _ => ExpConfig::default(),
    };

    let dist = DistEnv::from_env()?;
    if dist.is_distributed() {
        warn!(
            "launched as rank {} of {}, collectives run in single process mode",
            dist.rank, dist.world_size
        );
    }

    let mut exp = Exp::new(config, Arc::new(InMemoryProvider::new()))?;
    exp.merge(&args).context("applying overrides")?;
    info!("experiment:\n{}", exp.config());

    let batch_size = 64;
    let model = exp.get_model()?;
    info!(
        "model: {} tensors, {} values",
        model.params().len(),
        model.params().numel()
    );

    let lr = exp.basic_lr(batch_size);
    let groups = exp.get_optimizer(batch_size)?.param_groups().len();
    info!("optimizer: {groups} param groups, lr {lr:e} at batch size {batch_size}");

    let iters_per_epoch = 100;
    let scheduler = exp.get_lr_scheduler(lr, iters_per_epoch)?;
    let total = scheduler.total_iters();
    for iters in [0, total / 4, total / 2, total.saturating_sub(1)] {
        info!("lr at iter {iters}: {:e}", scheduler.update_lr(iters));
    }

    let size = exp.random_resize(&Solo::new(), 0, false).await?;
    info!("first multiscale size: {size:?}");

    Ok(())
}
