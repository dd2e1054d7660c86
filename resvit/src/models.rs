mod bottleneck;
mod enc_dec;
mod head;
mod resvit;

pub use bottleneck::{Bottleneck, BottleneckConfig};
pub use enc_dec::{
    build_enc_dec, Decoder, EncDecConfig, Encoder, EncoderOutput, ResidualBlock,
    ResidualBlockConfig,
};
pub use head::{OutputHead, OutputHeadConfig};
pub use resvit::{ResVitNet, ResVitNetConfig, ResVitNetRecord};
