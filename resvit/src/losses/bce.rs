use burn::{
    prelude::*,
    tensor::{backend::Backend, Tensor},
};

/// Binary cross-entropy over probabilities.
#[derive(Module, Debug)]
pub struct BceLoss<B: Backend> {
    eps: f32,
    _phantom: std::marker::PhantomData<B>,
}

#[derive(Config, Debug)]
pub struct BceLossConfig {
    /// Probabilities are clamped to `[eps, 1 - eps]` before the logarithm, so
    /// saturated predictions keep a finite loss and finite gradients.
    #[config(default = "1e-7")]
    pub eps: f32,
}

impl BceLossConfig {
    pub const fn init<B: Backend>(&self) -> BceLoss<B> {
        BceLoss {
            eps: self.eps,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<B: Backend> Default for BceLoss<B> {
    fn default() -> Self {
        BceLossConfig::new().init()
    }
}

impl<B: Backend> BceLoss<B> {
    /// Mean of `-(y * ln(p) + (1 - y) * ln(1 - p))`.
    ///
    /// `input` holds probabilities in `[0, 1]`; `target` may be soft.
    pub fn forward<const D: usize>(
        &self,
        input: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        assert_eq!(
            input.dims(),
            target.dims(),
            "BCE input and target shapes differ"
        );
        let eps = self.eps as f64;
        let input = input.clamp(eps, 1.0 - eps);

        let log_p = input.clone().log();
        let log_not_p = input.neg().add_scalar(1.0).log();
        let not_target = target.clone().neg().add_scalar(1.0);

        (target * log_p + not_target * log_not_p).neg().mean()
    }
}
