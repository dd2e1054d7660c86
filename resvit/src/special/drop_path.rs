//! # Stochastic Depth
//!
//! Drops whole residual branches per sample while gradients are being
//! tracked, rescaling the survivors so the expected activation is unchanged.

use burn::{prelude::*, tensor::Distribution};

/// Configuration for the `DropPath` module.
#[derive(Config, Debug)]
pub struct DropPathConfig {
    /// Probability of dropping the branch for a given sample.
    #[config(default = "0.0")]
    pub drop_prob: f64,
}

impl DropPathConfig {
    pub const fn init(&self) -> DropPath {
        DropPath {
            drop_prob: self.drop_prob,
        }
    }
}

/// Per-sample branch dropout. Inactive on backends without autodiff, so
/// inference and validation are deterministic.
#[derive(Module, Clone, Debug)]
pub struct DropPath {
    drop_prob: f64,
}

impl DropPath {
    /// # Shapes
    /// - input: `[batch_size, ...]`
    /// - output: `[batch_size, ...]`
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.drop_prob == 0.0 {
            return x;
        }
        let keep_prob = 1.0 - self.drop_prob;

        let mut mask_shape = [1; D];
        mask_shape[0] = x.dims()[0];
        let mask = Tensor::random(mask_shape, Distribution::Bernoulli(keep_prob), &x.device());

        x * mask / keep_prob
    }
}
