//! # Residual Encoder / Decoder
//!
//! A convolutional U-shaped pair. The encoder halves the resolution and
//! doubles the width at every stage; the decoder walks back up, fusing the
//! encoder's intermediate activations through concatenation.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use super::head::{OutputHead, OutputHeadConfig};
use crate::{
    checkpoint::{join_name, NamedParams, ParamMapper},
    error::{ResVitError, ResVitResult},
};

/// Shape of the encoder / decoder pair.
#[derive(Config, Debug)]
pub struct EncDecConfig {
    /// Channels of the input image and of the decoder output.
    pub in_channels: usize,
    /// Width of the stem; every encoder stage doubles it.
    #[config(default = "16")]
    pub base_channels: usize,
    /// Number of downsampling stages.
    #[config(default = "3")]
    pub depth: usize,
    /// Residual blocks per encoder stage.
    #[config(default = "1")]
    pub blocks_per_stage: usize,
}

impl EncDecConfig {
    pub fn validate(&self) -> ResVitResult<()> {
        if self.in_channels == 0 {
            return Err(ResVitError::InvalidConfiguration {
                reason: "enc_dec.in_channels must be positive".to_string(),
            });
        }
        if self.base_channels == 0 {
            return Err(ResVitError::InvalidConfiguration {
                reason: "enc_dec.base_channels must be positive".to_string(),
            });
        }
        if self.depth == 0 || self.depth > 8 {
            return Err(ResVitError::InvalidConfiguration {
                reason: format!("enc_dec.depth must be in 1..=8, got {}", self.depth),
            });
        }
        if self.blocks_per_stage == 0 {
            return Err(ResVitError::InvalidConfiguration {
                reason: "enc_dec.blocks_per_stage must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Width of the feature map at `level` (0 is the stem).
    pub const fn channels_at(&self, level: usize) -> usize {
        self.base_channels << level
    }

    /// Width of the deepest encoder output, which is also the bottleneck width.
    pub const fn bottleneck_channels(&self) -> usize {
        self.channels_at(self.depth)
    }
}

/// Builds the encoder and decoder described by `config`.
///
/// With `out_layer` set, an activation head over the decoder output is also
/// returned; callers that supply their own head pass `false`.
pub fn build_enc_dec<B: Backend>(
    config: &EncDecConfig,
    out_layer: bool,
    device: &B::Device,
) -> ResVitResult<(Encoder<B>, Decoder<B>, Option<OutputHead<B>>)> {
    config.validate()?;

    let stem = ConvBnReluConfig::new(config.in_channels, config.base_channels).init(device);
    let stages = (0..config.depth)
        .map(|level| {
            let blocks = (0..config.blocks_per_stage)
                .map(|index| {
                    let (in_channels, stride) = if index == 0 {
                        (config.channels_at(level), 2)
                    } else {
                        (config.channels_at(level + 1), 1)
                    };
                    ResidualBlockConfig::new(in_channels, config.channels_at(level + 1))
                        .with_stride(stride)
                        .init(device)
                })
                .collect();
            EncoderStage { blocks }
        })
        .collect();

    let decoder_stages = (0..config.depth)
        .rev()
        .map(|level| DecoderStage {
            fuse: ResidualBlockConfig::new(
                config.channels_at(level + 1) + config.channels_at(level),
                config.channels_at(level),
            )
            .init(device),
        })
        .collect();
    let proj = Conv2dConfig::new([config.base_channels, config.in_channels], [1, 1]).init(device);

    let head = out_layer.then(|| OutputHeadConfig::new(config.in_channels).init(device));

    Ok((
        Encoder { stem, stages },
        Decoder {
            stages: decoder_stages,
            proj,
        },
        head,
    ))
}

#[derive(Config, Debug)]
struct ConvBnReluConfig {
    in_channels: usize,
    out_channels: usize,
}

impl ConvBnReluConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> ConvBnRelu<B> {
        ConvBnRelu {
            conv: Conv2dConfig::new([self.in_channels, self.out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(self.out_channels).init(device),
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
struct ConvBnRelu<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> ConvBnRelu<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

impl<B: Backend> NamedParams for ConvBnRelu<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.conv = self.conv.map_named(&join_name(prefix, "conv"), mapper)?;
        self.bn = self.bn.map_named(&join_name(prefix, "bn"), mapper)?;
        Ok(self)
    }
}

/// Configuration for a two-convolution residual block.
#[derive(Config, Debug)]
pub struct ResidualBlockConfig {
    in_channels: usize,
    out_channels: usize,
    #[config(default = "1")]
    stride: usize,
}

impl ResidualBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualBlock<B> {
        let conv1 = Conv2dConfig::new([self.in_channels, self.out_channels], [3, 3])
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let conv2 = Conv2dConfig::new([self.out_channels, self.out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);

        // Projection shortcut whenever the identity cannot be added directly.
        let downsample = (self.stride != 1 || self.in_channels != self.out_channels).then(|| {
            Downsample {
                conv: Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
                    .with_stride([self.stride, self.stride])
                    .with_bias(false)
                    .init(device),
                bn: BatchNormConfig::new(self.out_channels).init(device),
            }
        });

        ResidualBlock {
            conv1,
            bn1: BatchNormConfig::new(self.out_channels).init(device),
            conv2,
            bn2: BatchNormConfig::new(self.out_channels).init(device),
            downsample,
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> NamedParams for Downsample<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.conv = self.conv.map_named(&join_name(prefix, "conv"), mapper)?;
        self.bn = self.bn.map_named(&join_name(prefix, "bn"), mapper)?;
        Ok(self)
    }
}

/// Basic residual block: conv-bn-relu, conv-bn, shortcut add, relu.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
    relu: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.bn.forward(downsample.conv.forward(x.clone())),
            None => x.clone(),
        };

        let out = self.conv1.forward(x);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);

        self.relu.forward(out + identity)
    }
}

impl<B: Backend> NamedParams for ResidualBlock<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.conv1 = self.conv1.map_named(&join_name(prefix, "conv1"), mapper)?;
        self.bn1 = self.bn1.map_named(&join_name(prefix, "bn1"), mapper)?;
        self.conv2 = self.conv2.map_named(&join_name(prefix, "conv2"), mapper)?;
        self.bn2 = self.bn2.map_named(&join_name(prefix, "bn2"), mapper)?;
        self.downsample = self
            .downsample
            .map_named(&join_name(prefix, "downsample"), mapper)?;
        Ok(self)
    }
}

#[derive(Module, Debug)]
struct EncoderStage<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> NamedParams for EncoderStage<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.blocks = self.blocks.map_named(&join_name(prefix, "blocks"), mapper)?;
        Ok(self)
    }
}

/// Encoder result: the deepest feature map plus the activations the decoder
/// fuses back in, ordered from shallowest to deepest.
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    pub features: Tensor<B, 4>,
    pub skips: Vec<Tensor<B, 4>>,
}

/// Residual encoder.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    stem: ConvBnRelu<B>,
    stages: Vec<EncoderStage<B>>,
}

impl<B: Backend> Encoder<B> {
    /// # Shapes
    /// - input: `[batch, in_channels, H, W]`
    /// - features: `[batch, base * 2^depth, ceil(H / 2^depth), ceil(W / 2^depth)]`
    pub fn forward(&self, x: Tensor<B, 4>) -> EncoderOutput<B> {
        let mut x = self.stem.forward(x);
        let mut skips = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            skips.push(x.clone());
            for block in &stage.blocks {
                x = block.forward(x);
            }
        }

        EncoderOutput { features: x, skips }
    }

    pub fn depth(&self) -> usize {
        self.stages.len()
    }
}

impl<B: Backend> NamedParams for Encoder<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.stem = self.stem.map_named(&join_name(prefix, "stem"), mapper)?;
        self.stages = self.stages.map_named(&join_name(prefix, "stages"), mapper)?;
        Ok(self)
    }
}

#[derive(Module, Debug)]
struct DecoderStage<B: Backend> {
    fuse: ResidualBlock<B>,
}

impl<B: Backend> DecoderStage<B> {
    fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = skip.dims();
        // The ndarray backend has no bilinear backward.
        let x = interpolate(
            x,
            [height, width],
            InterpolateOptions::new(InterpolateMode::Nearest),
        );
        self.fuse.forward(Tensor::cat(vec![x, skip], 1))
    }
}

impl<B: Backend> NamedParams for DecoderStage<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.fuse = self.fuse.map_named(&join_name(prefix, "fuse"), mapper)?;
        Ok(self)
    }
}

/// Upsampling decoder, deepest stage first.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    stages: Vec<DecoderStage<B>>,
    proj: Conv2d<B>,
}

impl<B: Backend> Decoder<B> {
    /// Consumes the bottleneck output and the encoder skips (shallowest first).
    ///
    /// # Shapes
    /// - output: `[batch, in_channels, H, W]` where `H x W` is the size of the first skip.
    pub fn forward(&self, x: Tensor<B, 4>, skips: Vec<Tensor<B, 4>>) -> ResVitResult<Tensor<B, 4>> {
        if skips.len() != self.stages.len() {
            return Err(ResVitError::InvalidTensorShape {
                expected: format!("{} skip connections", self.stages.len()),
                actual: format!("{} skip connections", skips.len()),
            });
        }

        let x = self
            .stages
            .iter()
            .zip(skips.into_iter().rev())
            .fold(x, |x, (stage, skip)| stage.forward(x, skip));

        Ok(self.proj.forward(x))
    }
}

impl<B: Backend> NamedParams for Decoder<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.stages = self.stages.map_named(&join_name(prefix, "stages"), mapper)?;
        self.proj = self.proj.map_named(&join_name(prefix, "proj"), mapper)?;
        Ok(self)
    }
}
