use std::ops::{Add, AddAssign};

use burn::{
    prelude::*,
    tensor::{backend::Backend, ElementConversion, Tensor},
};

/// Threshold used to turn both probabilities and soft masks into labels.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Maps every element to `1.0` where it is strictly greater than `threshold`
/// and to `0.0` elsewhere.
pub fn binarize<B: Backend, const D: usize>(pred: Tensor<B, D>, threshold: f32) -> Tensor<B, D> {
    pred.greater_elem(threshold).float()
}

/// Pixel counts of a binary prediction against a binary target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryConfusion {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
}

impl BinaryConfusion {
    /// Counts a prediction thresholded at `threshold` against a target
    /// thresholded at [`DEFAULT_THRESHOLD`].
    pub fn from_tensors<B: Backend, const D: usize>(
        predictions: Tensor<B, D>,
        targets: Tensor<B, D>,
        threshold: f32,
    ) -> Self {
        let total = predictions.shape().num_elements() as u64;
        let preds = predictions.greater_elem(threshold).int();
        let targets = targets.greater_elem(DEFAULT_THRESHOLD).int();

        let count = |tensor: Tensor<B, D, Int>| tensor.sum().into_scalar().elem::<i64>() as u64;
        let true_positives = count(preds.clone() * targets.clone());
        let predicted = count(preds);
        let actual = count(targets);

        let false_positives = predicted - true_positives;
        let false_negatives = actual - true_positives;
        Self {
            true_positives,
            false_positives,
            false_negatives,
            true_negatives: total - true_positives - false_positives - false_negatives,
        }
    }

    /// `tp / (tp + fp)`, or 0 when nothing was predicted positive.
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// `tp / (tp + fn)`, or 0 when the target has no positives.
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    /// Harmonic mean of precision and recall, or 0 when both are 0.
    pub fn f1(&self) -> f64 {
        ratio(
            2 * self.true_positives,
            2 * self.true_positives + self.false_positives + self.false_negatives,
        )
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.false_negatives + self.true_negatives
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl Add for BinaryConfusion {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            true_positives: self.true_positives + rhs.true_positives,
            false_positives: self.false_positives + rhs.false_positives,
            false_negatives: self.false_negatives + rhs.false_negatives,
            true_negatives: self.true_negatives + rhs.true_negatives,
        }
    }
}

impl AddAssign for BinaryConfusion {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Precision of `predictions` (thresholded at 0.5) against `targets`.
pub fn binary_precision<B: Backend, const D: usize>(
    predictions: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> f64 {
    BinaryConfusion::from_tensors(predictions, targets, DEFAULT_THRESHOLD).precision()
}

/// Recall of `predictions` (thresholded at 0.5) against `targets`.
pub fn binary_recall<B: Backend, const D: usize>(
    predictions: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> f64 {
    BinaryConfusion::from_tensors(predictions, targets, DEFAULT_THRESHOLD).recall()
}

/// F1 score of `predictions` (thresholded at 0.5) against `targets`.
pub fn binary_f1_score<B: Backend, const D: usize>(
    predictions: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> f64 {
    BinaryConfusion::from_tensors(predictions, targets, DEFAULT_THRESHOLD).f1()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn mask(values: [f32; 4]) -> Tensor<TestBackend, 4> {
        Tensor::<TestBackend, 1>::from_floats(values, &Default::default()).reshape([1, 1, 2, 2])
    }

    #[test]
    fn binarize_is_strictly_greater_than_threshold() {
        let pred = mask([0.5, 0.50001, 0.0, 1.0]);
        let values = binarize(pred, 0.5).into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn identical_masks_score_one() {
        let gt = mask([1.0, 0.0, 1.0, 0.0]);
        assert_relative_eq!(binary_precision(gt.clone(), gt.clone()), 1.0);
        assert_relative_eq!(binary_recall(gt.clone(), gt.clone()), 1.0);
        assert_relative_eq!(binary_f1_score(gt.clone(), gt), 1.0);
    }

    #[test]
    fn complement_scores_zero() {
        let gt = mask([1.0, 0.0, 1.0, 0.0]);
        let pred = mask([0.0, 1.0, 0.0, 1.0]);
        assert_relative_eq!(binary_precision(pred.clone(), gt.clone()), 0.0);
        assert_relative_eq!(binary_recall(pred.clone(), gt.clone()), 0.0);
        assert_relative_eq!(binary_f1_score(pred, gt), 0.0);
    }

    #[test]
    fn counts_partial_overlap() {
        let gt = mask([1.0, 1.0, 0.0, 0.0]);
        let pred = mask([0.9, 0.2, 0.7, 0.1]);
        let confusion = BinaryConfusion::from_tensors(pred, gt, DEFAULT_THRESHOLD);

        assert_eq!(
            confusion,
            BinaryConfusion {
                true_positives: 1,
                false_positives: 1,
                false_negatives: 1,
                true_negatives: 1,
            }
        );
        assert_relative_eq!(confusion.precision(), 0.5);
        assert_relative_eq!(confusion.recall(), 0.5);
        assert_relative_eq!(confusion.f1(), 0.5);
    }

    #[test]
    fn empty_prediction_and_target_score_zero() {
        let zeros = mask([0.0; 4]);
        let confusion = BinaryConfusion::from_tensors(zeros.clone(), zeros, DEFAULT_THRESHOLD);

        assert_eq!(confusion.true_negatives, 4);
        assert_eq!(confusion.precision(), 0.0);
        assert_eq!(confusion.recall(), 0.0);
        assert_eq!(confusion.f1(), 0.0);
    }

    #[test]
    fn confusions_accumulate() {
        let mut total = BinaryConfusion::default();
        total += BinaryConfusion {
            true_positives: 2,
            false_positives: 1,
            false_negatives: 0,
            true_negatives: 1,
        };
        total += BinaryConfusion {
            true_positives: 0,
            false_positives: 0,
            false_negatives: 2,
            true_negatives: 2,
        };
        assert_eq!(total.total(), 8);
        assert_relative_eq!(total.recall(), 0.5);
    }
}
