//! Trains the detector network through burn's `Learner`.
//!
//! The detector is still constructed first so the configuration is validated
//! and the pretrained checkpoint is overlaid; its network and datasets are then
//! handed to the learner.
//!
//! The `Learner` owns its optimizer. A fresh AdamW is built from the same
//! `optim` settings and passed to the builder, so the detector's own
//! optimizer (`configure_optimizers`) is not stepped here and its step count
//! stays at zero. Use the `train` binary to drive that instance.
//!
//! ```bash
//! cargo run --bin learner -- --config configs/resvit_detector.json --run configs/run.json
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use burn::{
    backend::Autodiff,
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    train::{
        metric::{LearningRateMetric, LossMetric},
        LearnerBuilder,
    },
};
use clap::Parser;
use resvit_burn::{
    metrics::BinaryScoreMetric, DetectorConfig, ResVitBatch, ResVitBatcher, ResVitDataset,
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
    let optim = config.optim.clone();

    std::fs::create_dir_all(&run.artifact_dir).with_context(|| {
        format!(
            "Failed to create artifact directory at {}",
            run.artifact_dir.display()
        )
    })?;

    let device = create_device();
    tracing::info!(backend = BACKEND_NAME, "starting learner training");

    let detector = ResVitDetector::<TrainBackend>::new(config, &device)
        .context("Failed to construct detector")?;
    let train_loader: Arc<dyn DataLoader<TrainBackend, ResVitBatch<TrainBackend>>> =
        loader(&run, detector.train_dataset().clone(), Some(run.seed));
    let valid_loader: Arc<dyn DataLoader<SelectedBackend, ResVitBatch<SelectedBackend>>> =
        loader(&run, detector.validation_dataset().clone(), None);
    let model = detector.into_model();

    let learner = LearnerBuilder::new(&run.artifact_dir)
        .metric_train_numeric(LossMetric::new())
        .metric_train_numeric(LearningRateMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_valid_numeric(BinaryScoreMetric::precision())
        .metric_valid_numeric(BinaryScoreMetric::recall())
        .metric_valid_numeric(BinaryScoreMetric::f1())
        .devices(vec![device])
        .num_epochs(run.num_epochs)
        .summary()
        .build(model, optim.adamw().init(), optim.lr);

    let trained = learner.fit(train_loader, valid_loader);

    let path = run.artifact_dir.join("final_model");
    trained
        .save_file(&path, &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
        .with_context(|| format!("Failed to save final model to {}", path.display()))?;

    println!("Training completed successfully!");
    Ok(())
}

fn loader<B: burn::tensor::backend::Backend>(
    run: &RunConfig,
    dataset: ResVitDataset,
    shuffle: Option<u64>,
) -> Arc<dyn DataLoader<B, ResVitBatch<B>>> {
    let builder = DataLoaderBuilder::new(ResVitBatcher)
        .batch_size(run.batch_size)
        .num_workers(run.num_workers);
    match shuffle {
        Some(seed) => builder.shuffle(seed).build(dataset),
        None => builder.build(dataset),
    }
}
