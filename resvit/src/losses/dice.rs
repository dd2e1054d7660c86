use burn::{prelude::*, tensor::backend::Backend};

/// Soft Dice loss over a whole batch.
#[derive(Module, Debug)]
pub struct DiceLoss<B: Backend> {
    smooth: f32,
    _phantom: std::marker::PhantomData<B>,
}

#[derive(Config, Debug)]
pub struct DiceLossConfig {
    /// Added to numerator and denominator; keeps empty masks defined.
    #[config(default = "1.0")]
    pub smooth: f32,
}

impl DiceLossConfig {
    pub const fn init<B: Backend>(&self) -> DiceLoss<B> {
        DiceLoss {
            smooth: self.smooth,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<B: Backend> Default for DiceLoss<B> {
    fn default() -> Self {
        DiceLossConfig::new().init()
    }
}

impl<B: Backend> DiceLoss<B> {
    /// `1 - (2 * sum(p * g) + s) / (sum(p) + sum(g) + s)`.
    pub fn forward<const D: usize>(
        &self,
        input: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        assert_eq!(
            input.dims(),
            target.dims(),
            "Dice input and target shapes differ"
        );

        let intersection = (input.clone() * target.clone()).sum();
        let total = input.sum() + target.sum();
        let dice = intersection
            .mul_scalar(2.0)
            .add_scalar(self.smooth)
            .div(total.add_scalar(self.smooth));

        dice.neg().add_scalar(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn perfect_overlap_is_zero() {
        let device = Default::default();
        let loss = DiceLoss::<TestBackend>::default();

        let mask = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [1.0, 1.0]], &device);
        let value = loss.forward(mask.clone(), mask).into_scalar();

        assert_relative_eq!(value, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn disjoint_masks_approach_one() {
        let device = Default::default();
        let loss = DiceLoss::<TestBackend>::default();

        let pred = Tensor::<TestBackend, 1>::from_floats([1.0, 1.0, 0.0, 0.0], &device);
        let target = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0, 1.0, 1.0], &device);

        // (0 + 1) / (4 + 1)
        assert_relative_eq!(loss.forward(pred, target).into_scalar(), 0.8, epsilon = 1e-6);
    }

    #[test]
    fn empty_prediction_and_mask_is_zero() {
        let device = Default::default();
        let loss = DiceLoss::<TestBackend>::default();

        let zeros = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &device);
        assert_relative_eq!(
            loss.forward(zeros.clone(), zeros).into_scalar(),
            0.0,
            epsilon = 1e-6
        );
    }
}
