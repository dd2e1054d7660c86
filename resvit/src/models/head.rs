use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d, Sigmoid,
    },
    prelude::*,
};

use crate::{
    checkpoint::{join_name, NamedParams, ParamMapper},
    error::ResVitResult,
};

/// Configuration for the probability head.
#[derive(Config, Debug)]
pub struct OutputHeadConfig {
    /// Channels in and out; the head never changes the channel count.
    pub channels: usize,
}

impl OutputHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> OutputHead<B> {
        OutputHead {
            conv: Conv2dConfig::new([self.channels, self.channels], [3, 3])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            activation: Sigmoid::new(),
        }
    }
}

/// 3x3 convolution followed by a sigmoid, mapping decoder output to per-pixel
/// probabilities in `[0, 1]`.
#[derive(Module, Debug)]
pub struct OutputHead<B: Backend> {
    conv: Conv2d<B>,
    activation: Sigmoid,
}

impl<B: Backend> OutputHead<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.activation.forward(self.conv.forward(x))
    }
}

impl<B: Backend> NamedParams for OutputHead<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.conv = self.conv.map_named(&join_name(prefix, "conv"), mapper)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn head_keeps_shape_and_bounds_values() {
        let device = Default::default();
        let head = OutputHeadConfig::new(2).init::<TestBackend>(&device);

        let x = Tensor::<TestBackend, 4>::random(
            [2, 2, 5, 7],
            burn::tensor::Distribution::Normal(0.0, 10.0),
            &device,
        );
        let y = head.forward(x);

        assert_eq!(y.dims(), [2, 2, 5, 7]);
        let min = y.clone().min().into_scalar();
        let max = y.max().into_scalar();
        assert!(min >= 0.0 && max <= 1.0);
    }
}
