//! Core configuration structures for the detector.

use std::path::{Path, PathBuf};

use burn::{optim::AdamWConfig, prelude::*};

use crate::{
    dataset::DatasetConfig,
    error::{ResVitError, ResVitResult},
    models::{BottleneckConfig, EncDecConfig},
};

/// Everything the detector needs at construction.
///
/// Every section is required; a JSON file missing any of them fails to load.
#[derive(Config, Debug)]
pub struct DetectorConfig {
    /// Encoder / decoder shape.
    pub enc_dec: EncDecConfig,
    /// Transformer bottleneck shape.
    pub bottleneck: BottleneckConfig,
    /// Checkpoint to warm-start from. A path that does not exist is ignored.
    pub pretrain: PathBuf,
    pub train_dataset: DatasetConfig,
    pub validation_dataset: DatasetConfig,
    pub test_dataset: DatasetConfig,
    /// AdamW hyperparameters.
    pub optim: OptimConfig,
}

/// AdamW hyperparameters.
#[derive(Config, Debug)]
pub struct OptimConfig {
    /// Constant learning rate.
    pub lr: f64,
    /// First and second moment decay rates.
    pub betas: [f32; 2],
    /// Decoupled weight decay.
    pub weight_decay: f32,
    #[config(default = "1e-8")]
    pub epsilon: f32,
}

impl OptimConfig {
    pub fn validate(&self) -> ResVitResult<()> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ResVitError::InvalidConfiguration {
                reason: format!("optim.lr must be a positive number, got {}", self.lr),
            });
        }
        if let Some(beta) = self.betas.iter().find(|b| !(0.0..1.0).contains(*b)) {
            return Err(ResVitError::InvalidConfiguration {
                reason: format!("optim.betas must lie in [0, 1), got {beta}"),
            });
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(ResVitError::InvalidConfiguration {
                reason: format!(
                    "optim.weight_decay must be non-negative, got {}",
                    self.weight_decay
                ),
            });
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(ResVitError::InvalidConfiguration {
                reason: format!("optim.epsilon must be positive, got {}", self.epsilon),
            });
        }
        Ok(())
    }

    /// The matching Burn optimizer configuration.
    pub fn adamw(&self) -> AdamWConfig {
        AdamWConfig::new()
            .with_beta_1(self.betas[0])
            .with_beta_2(self.betas[1])
            .with_weight_decay(self.weight_decay)
            .with_epsilon(self.epsilon)
    }
}

impl DetectorConfig {
    /// Loads a JSON configuration and validates it.
    pub fn from_file(path: impl AsRef<Path>) -> ResVitResult<Self> {
        let path = path.as_ref();
        let config = Self::load(path).map_err(|err| ResVitError::ConfigLoad {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section and the agreements between them.
    pub fn validate(&self) -> ResVitResult<()> {
        self.enc_dec.validate()?;
        self.bottleneck
            .validate(self.enc_dec.bottleneck_channels())?;
        self.optim.validate()?;

        for (section, dataset) in [
            ("train_dataset", &self.train_dataset),
            ("validation_dataset", &self.validation_dataset),
            ("test_dataset", &self.test_dataset),
        ] {
            dataset.validate()?;
            if dataset.channels != self.enc_dec.in_channels {
                return Err(ResVitError::InvalidConfiguration {
                    reason: format!(
                        "{section}.channels ({}) must equal enc_dec.in_channels ({})",
                        dataset.channels, self.enc_dec.in_channels
                    ),
                });
            }
        }
        Ok(())
    }
}
