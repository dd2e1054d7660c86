//! # ResViT Network
//!
//! Encoder, transformer bottleneck, decoder and probability head assembled
//! into one module, together with the losses it is trained against.

use burn::prelude::*;

use super::{
    bottleneck::{Bottleneck, BottleneckConfig},
    enc_dec::{build_enc_dec, Decoder, EncDecConfig, Encoder, EncoderOutput},
    head::{OutputHead, OutputHeadConfig},
};
use crate::{
    checkpoint::{
        join_name, Checkpoint, NamedParams, OverlayReport, ParamMapper, StateDict,
        StateDictCollector, StateDictOverlay,
    },
    error::{ResVitError, ResVitResult},
    losses::LossBundle,
};

/// Configuration for [`ResVitNet`].
#[derive(Config, Debug)]
pub struct ResVitNetConfig {
    pub enc_dec: EncDecConfig,
    pub bottleneck: BottleneckConfig,
}

impl ResVitNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResVitResult<ResVitNet<B>> {
        let (encoder, decoder, _) = build_enc_dec(&self.enc_dec, false, device)?;
        let bottleneck = self
            .bottleneck
            .init(self.enc_dec.bottleneck_channels(), device)?;
        let out = OutputHeadConfig::new(self.enc_dec.in_channels).init(device);

        Ok(ResVitNet {
            encoder,
            bottleneck,
            decoder,
            out,
            losses: LossBundle::new(),
            in_channels: self.enc_dec.in_channels,
        })
    }
}

/// Per-pixel text probability network.
#[derive(Module, Debug)]
pub struct ResVitNet<B: Backend> {
    encoder: Encoder<B>,
    bottleneck: Bottleneck<B>,
    decoder: Decoder<B>,
    out: OutputHead<B>,
    losses: LossBundle<B>,
    in_channels: usize,
}

impl<B: Backend> ResVitNet<B> {
    /// Maps images to per-pixel probabilities.
    ///
    /// # Shapes
    /// - images: `[batch, in_channels, H, W]`
    /// - output: `[batch, in_channels, H, W]`, every value in `[0, 1]`
    pub fn forward(&self, images: Tensor<B, 4>) -> ResVitResult<Tensor<B, 4>> {
        let [batch, channels, height, width] = images.dims();
        if channels != self.in_channels || batch == 0 || height == 0 || width == 0 {
            return Err(ResVitError::InvalidTensorShape {
                expected: format!("[N > 0, {}, H > 0, W > 0]", self.in_channels),
                actual: format!("{:?}", images.dims()),
            });
        }

        let EncoderOutput { features, skips } = self.encoder.forward(images);
        let x = self.bottleneck.forward(features);
        let x = self.decoder.forward(x, skips)?;

        Ok(self.out.forward(x))
    }

    /// Forward pass plus the training objective against `masks`.
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        masks: Tensor<B, 4>,
    ) -> ResVitResult<(Tensor<B, 4>, Tensor<B, 1>)> {
        let pred = self.forward(images)?;
        if pred.dims() != masks.dims() {
            return Err(ResVitError::InvalidTensorShape {
                expected: format!("mask of shape {:?}", pred.dims()),
                actual: format!("{:?}", masks.dims()),
            });
        }
        let loss = self.losses.objective(pred.clone(), masks);
        Ok((pred, loss))
    }

    pub const fn losses(&self) -> &LossBundle<B> {
        &self.losses
    }

    pub const fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Every learnable tensor and running statistic under its dotted name.
    pub fn state_dict(&self) -> ResVitResult<StateDict> {
        let mut collector = StateDictCollector::default();
        self.clone().map_named("", &mut collector)?;
        Ok(collector.state_dict)
    }

    /// Overwrites the tensors named in `state_dict`, leaving the rest as they are.
    pub fn load_state_dict(self, state_dict: &StateDict) -> ResVitResult<(Self, OverlayReport)> {
        let mut overlay = StateDictOverlay::new(state_dict);
        let model = self.map_named("", &mut overlay)?;
        Ok((model, overlay.finish()))
    }

    /// Like [`Self::load_state_dict`], honouring the checkpoint's weight layout.
    pub fn load_checkpoint(self, checkpoint: &Checkpoint) -> ResVitResult<(Self, OverlayReport)> {
        let mut overlay =
            StateDictOverlay::new(&checkpoint.state_dict).with_layout(checkpoint.layout);
        let model = self.map_named("", &mut overlay)?;
        Ok((model, overlay.finish()))
    }
}

impl<B: Backend> NamedParams for ResVitNet<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.encoder = self.encoder.map_named(&join_name(prefix, "encoder"), mapper)?;
        self.bottleneck = self
            .bottleneck
            .map_named(&join_name(prefix, "bottleneck"), mapper)?;
        self.decoder = self.decoder.map_named(&join_name(prefix, "decoder"), mapper)?;
        self.out = self.out.map_named(&join_name(prefix, "out"), mapper)?;
        Ok(self)
    }
}
