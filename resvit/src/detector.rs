//! The detector lifecycle driven by an external training loop.
//!
//! [`ResVitDetector`] owns the network, its datasets and one AdamW optimizer.
//! A driver constructs it once, then calls [`ResVitDetector::training_step`]
//! and [`ResVitDetector::validation_step`] in whatever order it likes,
//! applying gradients through the optimizer returned by
//! [`ResVitDetector::configure_optimizers`].

use std::{path::Path, sync::Arc};

use burn::{
    module::AutodiffModule,
    optim::{adaptor::OptimizerAdaptor, AdamW, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
    LearningRate,
};

use crate::{
    checkpoint::{Checkpoint, OverlayReport, StateDict},
    config::{DetectorConfig, OptimConfig},
    dataset::{ResVitBatch, ResVitDataset},
    error::ResVitResult,
    metrics::{binarize, BinaryConfusion, DEFAULT_THRESHOLD},
    models::{ResVitNet, ResVitNetConfig},
    sink::{MetricSink, TracingSink},
};

/// The AdamW instance built at construction, with its constant learning rate.
pub struct DetectorOptimizer<B: AutodiffBackend> {
    optim: OptimizerAdaptor<AdamW, ResVitNet<B>, B>,
    lr: LearningRate,
    steps: usize,
}

impl<B: AutodiffBackend> DetectorOptimizer<B> {
    pub fn new(config: &OptimConfig) -> Self {
        Self {
            optim: config.adamw().init(),
            lr: config.lr,
            steps: 0,
        }
    }

    /// The learning rate used by the most recent step. No scheduler is
    /// attached, so this is always the configured rate.
    pub const fn get_last_lr(&self) -> LearningRate {
        self.lr
    }

    /// Number of updates applied so far.
    pub const fn steps(&self) -> usize {
        self.steps
    }

    /// Applies one update to `model`.
    pub fn step(&mut self, model: ResVitNet<B>, grads: GradientsParams) -> ResVitNet<B> {
        self.steps += 1;
        self.optim.step(self.lr, model, grads)
    }
}

/// Document text detector: network, losses, datasets and optimizer.
pub struct ResVitDetector<B: AutodiffBackend> {
    config: DetectorConfig,
    model: ResVitNet<B>,
    train_dataset: ResVitDataset,
    validation_dataset: ResVitDataset,
    test_dataset: ResVitDataset,
    optimizer: DetectorOptimizer<B>,
    sink: Arc<dyn MetricSink>,
}

impl<B: AutodiffBackend> ResVitDetector<B> {
    /// Builds the detector, logging metrics through `tracing`.
    pub fn new(config: DetectorConfig, device: &B::Device) -> ResVitResult<Self> {
        Self::with_sink(config, device, Arc::new(TracingSink))
    }

    /// Builds the detector, logging metrics to `sink`.
    ///
    /// The pretrained checkpoint, when its path exists, is overlaid onto the
    /// fresh parameters: entries with matching names replace them, anything
    /// else on either side is left alone.
    pub fn with_sink(
        config: DetectorConfig,
        device: &B::Device,
        sink: Arc<dyn MetricSink>,
    ) -> ResVitResult<Self> {
        config.validate()?;

        let model = ResVitNetConfig::new(config.enc_dec.clone(), config.bottleneck.clone())
            .init::<B>(device)?;
        let model = Self::apply_pretrained(model, &config.pretrain, device)?;

        let train_dataset = ResVitDataset::new(&config.train_dataset)?;
        let validation_dataset = ResVitDataset::new(&config.validation_dataset)?;
        let test_dataset = ResVitDataset::new(&config.test_dataset)?;

        let optimizer = DetectorOptimizer::new(&config.optim);

        tracing::info!(
            in_channels = config.enc_dec.in_channels,
            depth = config.enc_dec.depth,
            params = model.num_params(),
            lr = config.optim.lr,
            "detector constructed"
        );

        Ok(Self {
            config,
            model,
            train_dataset,
            validation_dataset,
            test_dataset,
            optimizer,
            sink,
        })
    }

    fn apply_pretrained(
        model: ResVitNet<B>,
        path: &Path,
        device: &B::Device,
    ) -> ResVitResult<ResVitNet<B>> {
        if !path.is_file() {
            tracing::debug!(
                path = %path.display(),
                "no pretrained checkpoint, keeping fresh weights"
            );
            return Ok(model);
        }

        let checkpoint = Checkpoint::load::<B>(path, device)?;
        let (model, report) = model.load_checkpoint(&checkpoint)?;
        log_overlay(path, &report);
        Ok(model)
    }

    /// Per-pixel probabilities for `images`.
    pub fn forward(&self, images: Tensor<B, 4>) -> ResVitResult<Tensor<B, 4>> {
        self.model.forward(images)
    }

    /// Computes `BCE + Dice` on one batch and records `train_loss` and `lr`.
    ///
    /// Returns the scalar loss with its autodiff graph; the caller runs the
    /// backward pass and applies the update.
    pub fn training_step(
        &self,
        batch: ResVitBatch<B>,
        _batch_idx: usize,
    ) -> ResVitResult<Tensor<B, 1>> {
        let (_, loss) = self.model.forward_loss(batch.images, batch.masks)?;

        self.sink.record("train_loss", scalar(loss.clone()), true);
        self.sink.record("lr", self.optimizer.get_last_lr(), true);

        Ok(loss)
    }

    /// Evaluates one batch without tracking gradients.
    ///
    /// Records the loss (under `train_loss`), `lr`, `precision`, `recall` and
    /// `f1`, and returns the prediction binarized at 0.5.
    pub fn validation_step(
        &self,
        batch: ResVitBatch<B::InnerBackend>,
        _batch_idx: usize,
    ) -> ResVitResult<Tensor<B::InnerBackend, 4>> {
        let model = self.model.valid();
        let (pred, loss) = model.forward_loss(batch.images, batch.masks.clone())?;

        let binary = binarize(pred, DEFAULT_THRESHOLD);
        let confusion =
            BinaryConfusion::from_tensors(binary.clone(), batch.masks, DEFAULT_THRESHOLD);

        self.sink.record("train_loss", scalar(loss), true);
        self.sink.record("lr", self.optimizer.get_last_lr(), true);
        self.sink.record("precision", confusion.precision(), true);
        self.sink.record("recall", confusion.recall(), true);
        self.sink.record("f1", confusion.f1(), true);

        Ok(binary)
    }

    /// Declared for drivers that call it; does nothing.
    pub fn test_step(&self, _batch: ResVitBatch<B::InnerBackend>, _batch_idx: usize) {}

    /// Declared for drivers that call it; does nothing.
    pub fn predict(&self, _batch: ResVitBatch<B::InnerBackend>, _batch_idx: usize) {}

    /// The optimizer built at construction. Every call returns the same instance.
    pub fn configure_optimizers(&mut self) -> &mut DetectorOptimizer<B> {
        &mut self.optimizer
    }

    /// Runs one optimizer update from the gradients of a training loss.
    pub fn apply_gradients(&mut self, grads: B::Gradients) {
        let grads = GradientsParams::from_grads(grads, &self.model);
        let model = self.model.clone();
        self.model = self.optimizer.step(model, grads);
    }

    pub const fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub const fn model(&self) -> &ResVitNet<B> {
        &self.model
    }

    pub fn into_model(self) -> ResVitNet<B> {
        self.model
    }

    pub const fn train_dataset(&self) -> &ResVitDataset {
        &self.train_dataset
    }

    pub const fn validation_dataset(&self) -> &ResVitDataset {
        &self.validation_dataset
    }

    pub const fn test_dataset(&self) -> &ResVitDataset {
        &self.test_dataset
    }

    pub fn state_dict(&self) -> ResVitResult<StateDict> {
        self.model.state_dict()
    }

    /// Writes the current parameters in the checkpoint format read at construction.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> ResVitResult<()> {
        Checkpoint::new(self.state_dict()?).save(path)
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

fn log_overlay(path: &Path, report: &OverlayReport) {
    tracing::info!(
        path = %path.display(),
        applied = report.applied.len(),
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "pretrained checkpoint applied"
    );
    for name in &report.missing {
        tracing::debug!(%name, "parameter not in checkpoint");
    }
    for name in &report.unexpected {
        tracing::debug!(%name, "checkpoint entry matches no parameter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::StoredTensor,
        dataset::{DatasetConfig, ResVitBatcher},
        error::ResVitError,
        models::{BottleneckConfig, EncDecConfig},
        sink::MemorySink,
    };
    use burn::{
        backend::{Autodiff, NdArray},
        data::{dataloader::batcher::Batcher, dataset::Dataset},
        tensor::Distribution,
    };
    use image::{GrayImage, Luma};
    use std::path::PathBuf;

    type InnerBackend = NdArray<f32>;
    type TestBackend = Autodiff<InnerBackend>;

    struct Fixture {
        dir: tempfile::TempDir,
        config: DetectorConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        for sub in ["images", "masks"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        for stem in ["a", "b"] {
            let mut image = GrayImage::new(16, 16);
            let mut mask = GrayImage::new(16, 16);
            for y in 4..8 {
                for x in 2..14 {
                    image.put_pixel(x, y, Luma([255]));
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
            image.save(root.join("images").join(format!("{stem}.png"))).unwrap();
            mask.save(root.join("masks").join(format!("{stem}.png"))).unwrap();
        }

        let dataset = DatasetConfig::new(root).with_image_size([16, 16]);
        let config = DetectorConfig::new(
            EncDecConfig::new(1).with_base_channels(4).with_depth(2),
            BottleneckConfig::new().with_num_layers(1).with_num_heads(2),
            dir.path().join("missing.json"),
            dataset.clone(),
            dataset.clone(),
            dataset,
            OptimConfig::new(1e-3, [0.9, 0.999], 0.01),
        );
        Fixture { dir, config }
    }

    fn batch<B: Backend>(detector: &ResVitDetector<TestBackend>) -> ResVitBatch<B> {
        let dataset = detector.train_dataset();
        let items: Vec<_> = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();
        ResVitBatcher.batch(items, &Default::default())
    }

    fn detector_with_memory(
        config: DetectorConfig,
    ) -> (ResVitDetector<TestBackend>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let detector =
            ResVitDetector::with_sink(config, &Default::default(), sink.clone()).unwrap();
        (detector, sink)
    }

    #[test]
    fn missing_pretrain_path_keeps_fresh_weights() {
        let fixture = fixture();
        let (detector, _) = detector_with_memory(fixture.config);
        assert!(!detector.state_dict().unwrap().is_empty());
    }

    #[test]
    fn training_step_returns_non_negative_loss_and_logs() {
        let fixture = fixture();
        let (detector, sink) = detector_with_memory(fixture.config);

        let loss = detector
            .training_step(batch::<TestBackend>(&detector), 0)
            .unwrap();
        let value = loss.into_scalar();

        assert!(value.is_finite() && value >= 0.0);
        assert_eq!(sink.steps("train_loss").len(), 1);
        assert_eq!(sink.steps("lr"), vec![1e-3]);
    }

    #[test]
    fn all_zero_batch_has_finite_loss() {
        let fixture = fixture();
        let (detector, _) = detector_with_memory(fixture.config);
        let device = Default::default();

        let zeros = Tensor::<TestBackend, 4>::zeros([2, 1, 8, 8], &device);
        let batch = ResVitBatch {
            images: zeros.clone(),
            masks: zeros,
        };
        let value = detector.training_step(batch, 0).unwrap().into_scalar();

        assert!(value.is_finite());
    }

    #[test]
    fn validation_step_returns_binary_mask_and_logs_five_channels() {
        let fixture = fixture();
        let (detector, sink) = detector_with_memory(fixture.config);

        let pred = detector
            .validation_step(batch::<InnerBackend>(&detector), 0)
            .unwrap();

        assert_eq!(pred.dims(), [2, 1, 16, 16]);
        let values = pred.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 0.0 || *v == 1.0));

        for name in ["train_loss", "lr", "precision", "recall", "f1"] {
            let recorded = sink.steps(name);
            assert_eq!(recorded.len(), 1, "channel `{name}`");
            assert!(recorded[0].is_finite() && recorded[0] >= 0.0);
        }
    }

    #[test]
    fn validation_step_rejects_wrong_channel_count() {
        let fixture = fixture();
        let (detector, _) = detector_with_memory(fixture.config);
        let device = Default::default();

        let batch = ResVitBatch::<InnerBackend> {
            images: Tensor::zeros([1, 3, 8, 8], &device),
            masks: Tensor::zeros([1, 3, 8, 8], &device),
        };
        assert!(matches!(
            detector.validation_step(batch, 0),
            Err(ResVitError::InvalidTensorShape { .. })
        ));
    }

    #[test]
    fn optimizer_accessor_is_identity_stable() {
        let fixture = fixture();
        let (mut detector, _) = detector_with_memory(fixture.config);

        let first: *const DetectorOptimizer<TestBackend> = detector.configure_optimizers();
        let second: *const DetectorOptimizer<TestBackend> = detector.configure_optimizers();

        assert!(std::ptr::eq(first, second));
        assert_eq!(detector.configure_optimizers().get_last_lr(), 1e-3);
    }

    #[test]
    fn gradient_update_changes_parameters() {
        let fixture = fixture();
        let (mut detector, _) = detector_with_memory(fixture.config);
        let before = detector.state_dict().unwrap();

        let loss = detector
            .training_step(batch::<TestBackend>(&detector), 0)
            .unwrap();
        detector.apply_gradients(loss.backward());

        assert_eq!(detector.configure_optimizers().steps(), 1);
        assert_ne!(detector.state_dict().unwrap()["out.conv.weight"], before["out.conv.weight"]);
    }

    #[test]
    fn test_step_and_predict_do_nothing() {
        let fixture = fixture();
        let (detector, sink) = detector_with_memory(fixture.config);

        detector.test_step(batch::<InnerBackend>(&detector), 0);
        detector.predict(batch::<InnerBackend>(&detector), 0);

        assert!(sink.end_epoch().is_empty());
    }

    #[test]
    fn pretrained_checkpoint_applies_only_intersecting_keys() {
        let fixture = fixture();
        let reference = ResVitNetConfig::new(
            fixture.config.enc_dec.clone(),
            fixture.config.bottleneck.clone(),
        )
        .init::<TestBackend>(&Default::default())
        .unwrap()
        .state_dict()
        .unwrap();

        // One real key with known values, one key the model does not have.
        let head_weight = StoredTensor {
            shape: vec![1, 1, 3, 3],
            values: vec![0.25; 9],
        };
        let mut checkpoint = Checkpoint::default();
        checkpoint
            .state_dict
            .insert("out.conv.weight".to_string(), head_weight.clone());
        checkpoint.state_dict.insert(
            "auxiliary.head.weight".to_string(),
            StoredTensor {
                shape: vec![2],
                values: vec![1.0, 2.0],
            },
        );
        let path: PathBuf = fixture.dir.path().join("pretrain.json");
        checkpoint.save(&path).unwrap();

        let mut config = fixture.config.clone();
        config.pretrain = path;
        let (detector, _) = detector_with_memory(config);
        let state_dict = detector.state_dict().unwrap();

        assert_eq!(state_dict["out.conv.weight"], head_weight);
        assert!(!state_dict.contains_key("auxiliary.head.weight"));
        assert_eq!(state_dict.len(), reference.len());
    }

    #[test]
    fn pretrained_checkpoint_with_wrong_shape_fails_construction() {
        let fixture = fixture();
        let mut checkpoint = Checkpoint::default();
        checkpoint.state_dict.insert(
            "out.conv.weight".to_string(),
            StoredTensor {
                shape: vec![9],
                values: vec![0.0; 9],
            },
        );
        let path = fixture.dir.path().join("bad.json");
        checkpoint.save(&path).unwrap();

        let mut config = fixture.config.clone();
        config.pretrain = path;
        let result = ResVitDetector::<TestBackend>::new(config, &Default::default());

        assert!(matches!(
            result.err(),
            Some(ResVitError::CheckpointShapeMismatch { .. })
        ));
    }

    #[test]
    fn pytorch_pretrain_path_is_read_as_a_torch_archive() {
        let fixture = fixture();
        // A JSON body under a `.pth` name must not be accepted as JSON.
        let path = fixture.dir.path().join("pretrain.pth");
        Checkpoint::default().save(&path).unwrap();

        let mut config = fixture.config.clone();
        config.pretrain = path;
        let result = ResVitDetector::<TestBackend>::new(config, &Default::default());

        assert!(matches!(
            result.err(),
            Some(ResVitError::CheckpointIo { .. })
        ));
    }

    #[test]
    fn saved_checkpoint_warm_starts_a_new_detector() {
        let fixture = fixture();
        let (detector, _) = detector_with_memory(fixture.config.clone());
        let path = fixture.dir.path().join("saved.json");
        detector.save_checkpoint(&path).unwrap();

        let mut config = fixture.config.clone();
        config.pretrain = path;
        let (restored, _) = detector_with_memory(config);

        assert_eq!(restored.state_dict().unwrap(), detector.state_dict().unwrap());
    }

    #[test]
    fn forward_is_pure() {
        let fixture = fixture();
        let (detector, _) = detector_with_memory(fixture.config);
        let device = Default::default();
        let images =
            Tensor::<InnerBackend, 4>::random([1, 1, 8, 8], Distribution::Default, &device);

        let model = detector.model().valid();
        let a = model.forward(images.clone()).unwrap().into_data();
        let b = model.forward(images).unwrap().into_data();
        assert_eq!(a, b);
    }
}
