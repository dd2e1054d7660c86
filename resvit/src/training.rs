//! Burn `Learner` integration.
//!
//! Implements `TrainStep` and `ValidStep` for [`ResVitNet`] so the same
//! network and objective can be driven by Burn's `LearnerBuilder`.

use burn::{
    prelude::*,
    tensor::{backend::AutodiffBackend, Transaction},
    train::{
        metric::{Adaptor, ItemLazy, LossInput},
        TrainOutput, TrainStep, ValidStep,
    },
};

use crate::{dataset::ResVitBatch, metrics::BinaryMetricInput, models::ResVitNet};

/// Output of one training or validation step.
#[derive(Debug, Clone)]
pub struct DetectorOutput<B: Backend> {
    /// Per-pixel probabilities.
    pub prediction: Tensor<B, 4>,
    pub target: Tensor<B, 4>,
    /// `BCE + Dice`.
    pub loss: Tensor<B, 1>,
}

impl<B: Backend> ResVitNet<B> {
    /// Forward pass and objective on a whole batch.
    ///
    /// # Panics
    /// When the batch does not match the configured channel count; the
    /// learner has no error channel to report it through.
    pub fn forward_step(&self, batch: ResVitBatch<B>) -> DetectorOutput<B> {
        let target = batch.masks.clone();
        let (prediction, loss) = self
            .forward_loss(batch.images, batch.masks)
            .unwrap_or_else(|err| panic!("ResViT step failed: {err}"));

        DetectorOutput {
            prediction,
            target,
            loss,
        }
    }
}

impl<B: AutodiffBackend> TrainStep<ResVitBatch<B>, DetectorOutput<B>> for ResVitNet<B> {
    fn step(&self, batch: ResVitBatch<B>) -> TrainOutput<DetectorOutput<B>> {
        let item = self.forward_step(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ResVitBatch<B>, DetectorOutput<B>> for ResVitNet<B> {
    fn step(&self, batch: ResVitBatch<B>) -> DetectorOutput<B> {
        self.forward_step(batch)
    }
}

impl<B: Backend> ItemLazy for DetectorOutput<B> {
    type ItemSync = Self;

    fn sync(self) -> Self::ItemSync {
        let [prediction, target, loss] = Transaction::default()
            .register(self.prediction)
            .register(self.target)
            .register(self.loss)
            .execute()
            .try_into()
            .unwrap_or_else(|_| panic!("DetectorOutput registers exactly three tensors"));

        let device = &Default::default();

        Self {
            prediction: Tensor::from_data(prediction, device),
            target: Tensor::from_data(target, device),
            loss: Tensor::from_data(loss, device),
        }
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for DetectorOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<BinaryMetricInput<B>> for DetectorOutput<B> {
    fn adapt(&self) -> BinaryMetricInput<B> {
        BinaryMetricInput::new(self.prediction.clone(), self.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BottleneckConfig, EncDecConfig, ResVitNetConfig};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn train_step_produces_gradients_for_the_loss() {
        let device = Default::default();
        let model = ResVitNetConfig::new(
            EncDecConfig::new(1).with_base_channels(4).with_depth(1),
            BottleneckConfig::new().with_num_layers(1).with_num_heads(2),
        )
        .init::<TestBackend>(&device)
        .unwrap();

        let batch = ResVitBatch {
            images: Tensor::ones([2, 1, 8, 8], &device),
            masks: Tensor::zeros([2, 1, 8, 8], &device),
        };
        let output = TrainStep::step(&model, batch);

        assert_eq!(output.item.prediction.dims(), [2, 1, 8, 8]);
        assert!(output.item.loss.into_scalar() >= 0.0);
    }
}
