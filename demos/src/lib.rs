//! Drivers for the ResViT document text detector.
//!
//! ## Available binaries
//!
//! - `train`: runs the detector lifecycle by hand, one step at a time
//! - `learner`: trains the same network through burn's `Learner`
//!
//! Both read the same optional `--run` loop settings file.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin train -- --config configs/resvit_detector.json --run configs/run.json
//!
//! cargo run --bin learner --features wgpu --no-default-features -- \
//!     --config configs/resvit_detector.json --num-epochs 20
//! ```

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use cfg_if::cfg_if;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        /// Backend picked by the enabled feature.
        pub type SelectedBackend = burn::backend::Cuda;
        pub const BACKEND_NAME: &str = "cuda";
    } else if #[cfg(feature = "wgpu")] {
        /// Backend picked by the enabled feature.
        pub type SelectedBackend = burn::backend::Wgpu;
        pub const BACKEND_NAME: &str = "wgpu";
    } else {
        /// Backend picked by the enabled feature.
        pub type SelectedBackend = burn::backend::NdArray;
        pub const BACKEND_NAME: &str = "ndarray";
    }
}

/// Default device of [`SelectedBackend`].
pub fn create_device() -> <SelectedBackend as burn::tensor::backend::Backend>::Device {
    Default::default()
}

/// Loop settings shared by both drivers. Model, data and optimizer settings
/// live in the detector configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of passes over the training set.
    pub num_epochs: usize,
    /// Samples per batch.
    pub batch_size: usize,
    /// Data loading workers.
    pub num_workers: usize,
    /// Seed for shuffling the training set.
    pub seed: u64,
    /// Where checkpoints and learner artifacts are written.
    pub artifact_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 4,
            num_workers: 2,
            seed: 42,
            artifact_dir: PathBuf::from("artifacts"),
        }
    }
}

impl RunConfig {
    /// Reads a JSON settings file; fields it omits keep their defaults. No
    /// path means all defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run config: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse run config: {}", path.display()))
    }

    /// Applies command-line overrides, then checks the result.
    pub fn with_overrides(
        mut self,
        num_epochs: Option<usize>,
        batch_size: Option<usize>,
        artifact_dir: Option<PathBuf>,
    ) -> Result<Self> {
        if let Some(num_epochs) = num_epochs {
            self.num_epochs = num_epochs;
        }
        if let Some(batch_size) = batch_size {
            self.batch_size = batch_size;
        }
        if let Some(artifact_dir) = artifact_dir {
            self.artifact_dir = artifact_dir;
        }
        ensure!(self.batch_size > 0, "Batch size must be greater than 0");
        ensure!(self.num_epochs > 0, "Number of epochs must be greater than 0");
        Ok(self)
    }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
