//! Burn `Metric` implementations over binary confusion counts.
//!
//! Counts accumulate across every batch of an epoch, so the reported value
//! is the epoch-level score rather than a mean of per-batch scores.

use std::marker::PhantomData;

use burn::{
    prelude::*,
    tensor::backend::Backend,
    train::metric::{Metric, MetricEntry, MetricMetadata, Numeric},
};

use super::binary::{BinaryConfusion, DEFAULT_THRESHOLD};

/// Probabilities and ground truth for one batch.
pub struct BinaryMetricInput<B: Backend> {
    pub predictions: Tensor<B, 4>,
    pub targets: Tensor<B, 4>,
}

impl<B: Backend> BinaryMetricInput<B> {
    pub const fn new(predictions: Tensor<B, 4>, targets: Tensor<B, 4>) -> Self {
        Self {
            predictions,
            targets,
        }
    }
}

/// Which ratio of the confusion counts a metric reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryScore {
    Precision,
    Recall,
    F1,
}

impl BinaryScore {
    const fn name(self) -> &'static str {
        match self {
            Self::Precision => "Precision",
            Self::Recall => "Recall",
            Self::F1 => "F1",
        }
    }

    fn of(self, confusion: &BinaryConfusion) -> f64 {
        match self {
            Self::Precision => confusion.precision(),
            Self::Recall => confusion.recall(),
            Self::F1 => confusion.f1(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BinaryScoreMetric<B: Backend> {
    score: BinaryScore,
    threshold: f32,
    confusion: BinaryConfusion,
    _b: PhantomData<B>,
}

impl<B: Backend> BinaryScoreMetric<B> {
    pub const fn new(score: BinaryScore) -> Self {
        Self {
            score,
            threshold: DEFAULT_THRESHOLD,
            confusion: BinaryConfusion {
                true_positives: 0,
                false_positives: 0,
                false_negatives: 0,
                true_negatives: 0,
            },
            _b: PhantomData,
        }
    }

    pub const fn precision() -> Self {
        Self::new(BinaryScore::Precision)
    }

    pub const fn recall() -> Self {
        Self::new(BinaryScore::Recall)
    }

    pub const fn f1() -> Self {
        Self::new(BinaryScore::F1)
    }

    fn accumulate(&mut self, item: &BinaryMetricInput<B>) {
        self.confusion += BinaryConfusion::from_tensors(
            item.predictions.clone(),
            item.targets.clone(),
            self.threshold,
        );
    }

    #[must_use]
    pub const fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

impl<B: Backend> Metric for BinaryScoreMetric<B> {
    type Input = BinaryMetricInput<B>;

    fn name(&self) -> String {
        self.score.name().to_string()
    }

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        self.accumulate(item);
        let value = self.value();
        MetricEntry::new(self.name(), format!("{value:.5}"), format!("{value:.5}"))
    }

    fn clear(&mut self) {
        self.confusion = BinaryConfusion::default();
    }
}

impl<B: Backend> Numeric for BinaryScoreMetric<B> {
    fn value(&self) -> f64 {
        self.score.of(&self.confusion)
    }
}
