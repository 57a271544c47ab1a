//! Checkpoint inspection tool
//!
//! Prints the tracker entry, on-disk format and rank-0 record summary of a
//! checkpoint root.
//!
//! Usage: `ckpt-inspect <root> [iteration]`

use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use checkpoint::{Checkpointer, RngStreams};
use runtime_core::{LocalProcessGroup, ProcessGroupHandle};
use storage::{LocalStorage, StorageBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "checkpoint=warn,storage=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let root = match args.next() {
        Some(root) => root,
        None => {
            eprintln!("usage: ckpt-inspect <root> [iteration]");
            std::process::exit(2);
        }
    };
    let iteration = args.next().map(|s| s.parse::<u64>()).transpose()?;

    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&root));
    let group: ProcessGroupHandle = Arc::new(LocalProcessGroup::single());
    let checkpointer = Checkpointer::new(storage, group, Arc::new(Mutex::new(RngStreams::from_seed(0))));

    let Some(summary) = checkpointer.inspect("", iteration).await? else {
        println!("no checkpoint tracker under {}", root);
        return Ok(());
    };

    println!("checkpoint:  {}", summary.entry);
    println!("format:      {}", summary.format);
    println!("record:      {}", summary.path);
    match summary.iteration {
        Some(iteration) => println!("iteration:   {}", iteration),
        None => println!("iteration:   <none>"),
    }
    if let Some(version) = summary.checkpoint_version {
        println!("version:     {}", version);
    }
    println!("flops:       {:e}", summary.num_floating_point_operations_so_far);

    if let Some(config) = &summary.run_config {
        println!(
            "parallelism: tp={} pp={} cp={} dp={} ep={}",
            config.tensor_model_parallel_size,
            config.pipeline_model_parallel_size,
            config.context_parallel_size,
            config.data_parallel_size,
            config.expert_model_parallel_size
        );
        println!(
            "consumed:    train={} valid={}",
            config.consumed_train_samples, config.consumed_valid_samples
        );
    }

    println!("keys:        {}", summary.keys.join(", "));
    Ok(())
}
