//! ResViT document text detector on Burn.
//!
//! A residual convolutional encoder, a vision-transformer bottleneck and a
//! residual decoder produce a per-pixel text probability map. The
//! [`ResVitDetector`] wraps the network with its losses, datasets and
//! optimizer behind the hooks an external training loop calls.

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod error;
pub mod losses;
pub mod metrics;
pub mod models;
pub mod sink;
mod special;
#[cfg(feature = "train")]
pub mod training;

#[cfg(test)]
mod tests;

pub use config::{DetectorConfig, OptimConfig};
pub use dataset::{DatasetConfig, ResVitBatch, ResVitBatcher, ResVitDataset, ResVitItem};
pub use detector::{DetectorOptimizer, ResVitDetector};
pub use error::{ResVitError, ResVitResult};
pub use models::{BottleneckConfig, EncDecConfig, ResVitNet, ResVitNetConfig, ResVitNetRecord};
pub use sink::{MemorySink, MetricSink, TracingSink};
#[cfg(feature = "train")]
pub use training::DetectorOutput;
