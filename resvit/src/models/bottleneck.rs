//! # Transformer Bottleneck
//!
//! Treats every position of the deepest feature map as a token and runs a
//! stack of pre-norm transformer blocks over them. Positional information
//! comes from a depthwise convolution over the map, so any spatial size works.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig,
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::softmax,
};

use crate::{
    checkpoint::{join_name, NamedParams, ParamMapper},
    error::{ResVitError, ResVitResult},
    special::{DropPath, DropPathConfig},
};

/// Shape of the transformer bottleneck.
#[derive(Config, Debug)]
pub struct BottleneckConfig {
    /// Number of transformer blocks.
    #[config(default = "2")]
    pub num_layers: usize,
    /// Attention heads per block; must divide the token width.
    #[config(default = "4")]
    pub num_heads: usize,
    /// Hidden width of the MLP relative to the token width.
    #[config(default = "2.0")]
    pub mlp_ratio: f64,
    /// Dropout applied after attention and MLP projections.
    #[config(default = "0.0")]
    pub dropout: f64,
    /// Stochastic depth rate of the last block; earlier blocks scale linearly from 0.
    #[config(default = "0.0")]
    pub drop_path: f64,
}

impl BottleneckConfig {
    /// Checks this configuration against the token width it will run at.
    pub fn validate(&self, dim: usize) -> ResVitResult<()> {
        if self.num_heads == 0 || dim % self.num_heads != 0 {
            return Err(ResVitError::InvalidConfiguration {
                reason: format!(
                    "bottleneck.num_heads ({}) must divide the bottleneck width ({dim})",
                    self.num_heads
                ),
            });
        }
        if !(self.mlp_ratio.is_finite() && self.mlp_ratio > 0.0) {
            return Err(ResVitError::InvalidConfiguration {
                reason: format!("bottleneck.mlp_ratio must be positive, got {}", self.mlp_ratio),
            });
        }
        for (name, value) in [("dropout", self.dropout), ("drop_path", self.drop_path)] {
            if !(0.0..1.0).contains(&value) {
                return Err(ResVitError::InvalidConfiguration {
                    reason: format!("bottleneck.{name} must be in [0, 1), got {value}"),
                });
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, dim: usize, device: &B::Device) -> ResVitResult<Bottleneck<B>> {
        self.validate(dim)?;

        let pos_embed = Conv2dConfig::new([dim, dim], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_groups(dim)
            .init(device);

        let hidden = ((dim as f64) * self.mlp_ratio).round().max(1.0) as usize;
        let blocks = (0..self.num_layers)
            .map(|index| {
                let drop_path = if self.num_layers > 1 {
                    self.drop_path * index as f64 / (self.num_layers - 1) as f64
                } else {
                    self.drop_path
                };
                TransformerBlock {
                    norm1: LayerNormConfig::new(dim).init(device),
                    attn: AttentionConfig::new(dim, self.num_heads)
                        .with_dropout(self.dropout)
                        .init(device),
                    norm2: LayerNormConfig::new(dim).init(device),
                    mlp: MlpConfig::new(dim, hidden)
                        .with_dropout(self.dropout)
                        .init(device),
                    drop_path: DropPathConfig::new().with_drop_prob(drop_path).init(),
                }
            })
            .collect();

        Ok(Bottleneck {
            pos_embed,
            blocks,
            norm: LayerNormConfig::new(dim).init(device),
        })
    }
}

#[derive(Config, Debug)]
struct MlpConfig {
    dim: usize,
    hidden: usize,
    #[config(default = "0.0")]
    dropout: f64,
}

impl MlpConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        Mlp {
            fc1: LinearConfig::new(self.dim, self.hidden).init(device),
            act: Gelu::new(),
            fc2: LinearConfig::new(self.hidden, self.dim).init(device),
            drop: DropoutConfig::new(self.dropout).init(),
        }
    }
}

#[derive(Module, Debug)]
struct Mlp<B: Backend> {
    fc1: Linear<B>,
    act: Gelu,
    fc2: Linear<B>,
    drop: Dropout,
}

impl<B: Backend> Mlp<B> {
    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.fc1.forward(x);
        let x = self.act.forward(x);
        let x = self.drop.forward(x);
        let x = self.fc2.forward(x);
        self.drop.forward(x)
    }
}

impl<B: Backend> NamedParams for Mlp<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.fc1 = self.fc1.map_named(&join_name(prefix, "fc1"), mapper)?;
        self.fc2 = self.fc2.map_named(&join_name(prefix, "fc2"), mapper)?;
        Ok(self)
    }
}

#[derive(Config, Debug)]
struct AttentionConfig {
    dim: usize,
    num_heads: usize,
    #[config(default = "0.0")]
    dropout: f64,
}

impl AttentionConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> Attention<B> {
        let head_dim = self.dim / self.num_heads;
        Attention {
            num_heads: self.num_heads,
            scale: (head_dim as f64).powf(-0.5),
            qkv: LinearConfig::new(self.dim, self.dim * 3).init(device),
            attn_drop: DropoutConfig::new(self.dropout).init(),
            proj: LinearConfig::new(self.dim, self.dim).init(device),
            proj_drop: DropoutConfig::new(self.dropout).init(),
        }
    }
}

/// Global multi-head self-attention over all tokens.
#[derive(Module, Debug)]
struct Attention<B: Backend> {
    num_heads: usize,
    scale: f64,
    qkv: Linear<B>,
    attn_drop: Dropout,
    proj: Linear<B>,
    proj_drop: Dropout,
}

impl<B: Backend> Attention<B> {
    /// # Shapes
    /// - x: `[batch, tokens, dim]`
    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [b, n, c] = x.dims();
        let head_dim = c / self.num_heads;

        // [3, batch, heads, tokens, head_dim]
        let qkv = self
            .qkv
            .forward(x)
            .reshape([b, n, 3, self.num_heads, head_dim])
            .permute([2, 0, 3, 1, 4]);
        let split = |index: usize| -> Tensor<B, 4> {
            qkv.clone()
                .slice([index..index + 1, 0..b, 0..self.num_heads, 0..n, 0..head_dim])
                .reshape([b, self.num_heads, n, head_dim])
        };
        let (q, k, v) = (split(0), split(1), split(2));

        let attn = (q * self.scale).matmul(k.swap_dims(2, 3));
        let attn = softmax(attn, 3);
        let attn = self.attn_drop.forward(attn);

        let x = attn.matmul(v).swap_dims(1, 2).reshape([b, n, c]);
        let x = self.proj.forward(x);
        self.proj_drop.forward(x)
    }
}

impl<B: Backend> NamedParams for Attention<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.qkv = self.qkv.map_named(&join_name(prefix, "qkv"), mapper)?;
        self.proj = self.proj.map_named(&join_name(prefix, "proj"), mapper)?;
        Ok(self)
    }
}

#[derive(Module, Debug)]
struct TransformerBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attn: Attention<B>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
    drop_path: DropPath,
}

impl<B: Backend> TransformerBlock<B> {
    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone()
            + self
                .drop_path
                .forward(self.attn.forward(self.norm1.forward(x)));
        x.clone() + self.drop_path.forward(self.mlp.forward(self.norm2.forward(x)))
    }
}

impl<B: Backend> NamedParams for TransformerBlock<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.norm1 = self.norm1.map_named(&join_name(prefix, "norm1"), mapper)?;
        self.attn = self.attn.map_named(&join_name(prefix, "attn"), mapper)?;
        self.norm2 = self.norm2.map_named(&join_name(prefix, "norm2"), mapper)?;
        self.mlp = self.mlp.map_named(&join_name(prefix, "mlp"), mapper)?;
        Ok(self)
    }
}

/// Vision-transformer bottleneck between encoder and decoder.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pos_embed: Conv2d<B>,
    blocks: Vec<TransformerBlock<B>>,
    norm: LayerNorm<B>,
}

impl<B: Backend> Bottleneck<B> {
    /// # Shapes
    /// - input: `[batch, dim, H, W]`
    /// - output: `[batch, dim, H, W]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let x = x.clone() + self.pos_embed.forward(x);

        // [batch, H*W, dim]
        let tokens = x.reshape([b, c, h * w]).swap_dims(1, 2);
        let tokens = self
            .blocks
            .iter()
            .fold(tokens, |tokens, block| block.forward(tokens));
        let tokens = self.norm.forward(tokens);

        tokens.swap_dims(1, 2).reshape([b, c, h, w])
    }
}

impl<B: Backend> NamedParams for Bottleneck<B> {
    fn map_named<M: ParamMapper>(mut self, prefix: &str, mapper: &mut M) -> ResVitResult<Self> {
        self.pos_embed = self.pos_embed.map_named(&join_name(prefix, "pos_embed"), mapper)?;
        self.blocks = self.blocks.map_named(&join_name(prefix, "blocks"), mapper)?;
        self.norm = self.norm.map_named(&join_name(prefix, "norm"), mapper)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray<f32>;

    #[test]
    fn bottleneck_preserves_feature_map_shape() {
        let device = Default::default();
        let bottleneck = BottleneckConfig::new()
            .with_num_layers(2)
            .with_num_heads(4)
            .init::<TestBackend>(16, &device)
            .unwrap();

        let x = Tensor::<TestBackend, 4>::random([2, 16, 3, 5], Distribution::Default, &device);
        let y = bottleneck.forward(x);

        assert_eq!(y.dims(), [2, 16, 3, 5]);
    }

    #[test]
    fn heads_must_divide_width() {
        let config = BottleneckConfig::new().with_num_heads(3);
        match config.validate(16) {
            Err(ResVitError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("num_heads"));
            }
            _ => panic!("Expected InvalidConfiguration error"),
        }
    }

    #[test]
    fn drop_path_rate_outside_unit_interval_is_rejected() {
        let config = BottleneckConfig::new().with_drop_path(1.0);
        assert!(config.validate(16).is_err());
    }
}
