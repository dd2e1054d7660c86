//! Manual training driver.
//!
//! Builds a [`ResVitDetector`] and walks it through its lifecycle by hand:
//! a training pass with one optimizer update per batch, a validation pass,
//! then the test pass. Epoch means of every recorded metric are printed and
//! the weights are written as a checkpoint after each epoch.
//!
//! ```bash
//! cargo run --bin train -- --config configs/resvit_detector.json --num-epochs 5
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use burn::{
    backend::Autodiff,
    data::dataloader::{DataLoader, DataLoaderBuilder},
};
use clap::Parser;
use resvit_burn::{
    DetectorConfig, MemorySink, MetricSink, ResVitBatch, ResVitBatcher, ResVitDataset,
    ResVitDetector,
};
use resvit_demos::{create_device, init_tracing, RunConfig, SelectedBackend, BACKEND_NAME};

type TrainBackend = Autodiff<SelectedBackend>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Detector configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Loop settings file; defaults apply when omitted
    #[arg(long)]
    run: Option<PathBuf>,

    /// Override number of epochs
    #[arg(long)]
    num_epochs: Option<usize>,

    /// Override batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override artifact directory
    #[arg(long)]
    artifact_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let run = RunConfig::load(args.run.as_deref())?.with_overrides(
        args.num_epochs,
        args.batch_size,
        args.artifact_dir,
    )?;

    let config = DetectorConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load detector config {}", args.config.display()))?;

    std::fs::create_dir_all(&run.artifact_dir).with_context(|| {
        format!(
            "Failed to create artifact directory at {}",
            run.artifact_dir.display()
        )
    })?;

    let device = create_device();
    tracing::info!(backend = BACKEND_NAME, "starting manual training");

    let sink = Arc::new(MemorySink::new());
    let mut detector = ResVitDetector::<TrainBackend>::with_sink(
        config,
        &device,
        sink.clone() as Arc<dyn MetricSink>,
    )
    .context("Failed to construct detector")?;

    let train_loader = train_loader(&run, detector.train_dataset().clone());
    let valid_loader = eval_loader(&run, detector.validation_dataset().clone());
    let test_loader = eval_loader(&run, detector.test_dataset().clone());

    for epoch in 1..=run.num_epochs {
        for (batch_idx, batch) in train_loader.iter().enumerate() {
            let loss = detector.training_step(batch, batch_idx)?;
            let grads = loss.backward();
            detector.apply_gradients(grads);
        }
        print_epoch("train", epoch, &sink);

        for (batch_idx, batch) in valid_loader.iter().enumerate() {
            detector.validation_step(batch, batch_idx)?;
        }
        print_epoch("valid", epoch, &sink);

        for (batch_idx, batch) in test_loader.iter().enumerate() {
            detector.test_step(batch, batch_idx);
        }

        let path = run.artifact_dir.join(format!("checkpoint-{epoch}.json"));
        detector
            .save_checkpoint(&path)
            .with_context(|| format!("Failed to save checkpoint to {}", path.display()))?;
        tracing::info!(
            epoch,
            steps = detector.configure_optimizers().steps(),
            path = %path.display(),
            "checkpoint written"
        );
    }

    println!("Training completed successfully!");
    Ok(())
}

fn train_loader(
    run: &RunConfig,
    dataset: ResVitDataset,
) -> Arc<dyn DataLoader<TrainBackend, ResVitBatch<TrainBackend>>> {
    DataLoaderBuilder::new(ResVitBatcher)
        .batch_size(run.batch_size)
        .shuffle(run.seed)
        .num_workers(run.num_workers)
        .build(dataset)
}

fn eval_loader(
    run: &RunConfig,
    dataset: ResVitDataset,
) -> Arc<dyn DataLoader<SelectedBackend, ResVitBatch<SelectedBackend>>> {
    DataLoaderBuilder::new(ResVitBatcher)
        .batch_size(run.batch_size)
        .num_workers(run.num_workers)
        .build(dataset)
}

fn print_epoch(split: &str, epoch: usize, sink: &MemorySink) {
    let summary = sink
        .end_epoch()
        .into_iter()
        .map(|(name, value)| format!("{name}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!("[{split}] epoch {epoch}: {summary}");
}
