//! Image / mask pair datasets.
//!
//! A dataset directory holds an image folder and a mask folder; an image and
//! a mask belong together when their file stems match. Items are decoded on
//! demand and kept backend-agnostic until the batcher moves them to a device.

use std::path::{Path, PathBuf};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
    tensor::{backend::Backend, Tensor, TensorData},
};
use image::{imageops::FilterType, DynamicImage};
use walkdir::WalkDir;

use crate::error::{ResVitError, ResVitResult};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Where a dataset lives and how its samples are shaped.
#[derive(Config, Debug)]
pub struct DatasetConfig {
    /// Dataset root directory.
    pub root: PathBuf,
    /// Image folder, relative to `root`.
    #[config(default = "PathBuf::from(\"images\")")]
    pub images_dir: PathBuf,
    /// Mask folder, relative to `root`.
    #[config(default = "PathBuf::from(\"masks\")")]
    pub masks_dir: PathBuf,
    /// Output size as `[height, width]`.
    #[config(default = "[256, 256]")]
    pub image_size: [usize; 2],
    /// 1 for grayscale input, 3 for RGB.
    #[config(default = "1")]
    pub channels: usize,
}

impl DatasetConfig {
    pub fn validate(&self) -> ResVitResult<()> {
        if self.image_size.contains(&0) {
            return Err(ResVitError::InvalidConfiguration {
                reason: format!("dataset image_size must be non-zero, got {:?}", self.image_size),
            });
        }
        if !matches!(self.channels, 1 | 3) {
            return Err(ResVitError::InvalidConfiguration {
                reason: format!("dataset channels must be 1 or 3, got {}", self.channels),
            });
        }
        Ok(())
    }
}

/// One decoded sample, both tensors laid out `[C, H, W]` with values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ResVitItem {
    pub image: TensorData,
    pub mask: TensorData,
}

/// A batch of samples: `images` and `masks` are `[N, C, H, W]`.
#[derive(Debug, Clone)]
pub struct ResVitBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub masks: Tensor<B, 4>,
}

/// Stacks [`ResVitItem`]s on the requested device.
#[derive(Debug, Clone, Default)]
pub struct ResVitBatcher;

impl<B: Backend> Batcher<B, ResVitItem, ResVitBatch<B>> for ResVitBatcher {
    fn batch(&self, items: Vec<ResVitItem>, device: &B::Device) -> ResVitBatch<B> {
        let (images, masks): (Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|item| {
                (
                    Tensor::<B, 3>::from_data(item.image, device),
                    Tensor::<B, 3>::from_data(item.mask, device),
                )
            })
            .unzip();

        ResVitBatch {
            images: Tensor::stack(images, 0),
            masks: Tensor::stack(masks, 0),
        }
    }
}

/// Image / mask pairs discovered under a [`DatasetConfig`].
#[derive(Debug, Clone)]
pub struct ResVitDataset {
    pairs: Vec<(PathBuf, PathBuf)>,
    image_size: [usize; 2],
    channels: usize,
}

impl ResVitDataset {
    /// Scans the image folder and pairs every image with its mask.
    ///
    /// Fails when either folder is missing or no pair is found. Images
    /// without a mask are skipped with a warning.
    pub fn new(config: &DatasetConfig) -> ResVitResult<Self> {
        config.validate()?;

        let image_root = config.root.join(&config.images_dir);
        let mask_root = config.root.join(&config.masks_dir);
        for (kind, dir) in [("Image", &image_root), ("Mask", &mask_root)] {
            if !dir.is_dir() {
                return Err(ResVitError::Dataset {
                    message: format!("{kind} directory does not exist: {}", dir.display()),
                });
            }
        }

        let mut pairs = Vec::new();
        for entry in WalkDir::new(&image_root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| ResVitError::Dataset {
                message: format!("Failed to read {}: {e}", image_root.display()),
            })?;
            let image_path = entry.path();
            if !entry.file_type().is_file() || !has_image_extension(image_path) {
                continue;
            }

            match find_mask(&mask_root, image_path) {
                Some(mask_path) => pairs.push((image_path.to_path_buf(), mask_path)),
                None => tracing::warn!(image = %image_path.display(), "no mask found, skipping"),
            }
        }

        if pairs.is_empty() {
            return Err(ResVitError::Dataset {
                message: format!("No image/mask pairs found under {}", config.root.display()),
            });
        }
        tracing::info!(root = %config.root.display(), samples = pairs.len(), "dataset ready");

        Ok(Self {
            pairs,
            image_size: config.image_size,
            channels: config.channels,
        })
    }

    pub fn pairs(&self) -> &[(PathBuf, PathBuf)] {
        &self.pairs
    }

    fn load(&self, image_path: &Path, mask_path: &Path) -> ResVitResult<ResVitItem> {
        let [height, width] = self.image_size;
        let shape = [self.channels, height, width];

        let image = open_resized(image_path, height, width, FilterType::Triangle)?;
        let image = match self.channels {
            1 => image.to_luma32f().into_raw(),
            _ => hwc_to_chw(&image.to_rgb32f().into_raw(), self.channels),
        };

        let mask = open_resized(mask_path, height, width, FilterType::Nearest)?
            .to_luma32f()
            .into_raw()
            .repeat(self.channels);

        Ok(ResVitItem {
            image: TensorData::new(image, shape),
            mask: TensorData::new(mask, shape),
        })
    }
}

impl Dataset<ResVitItem> for ResVitDataset {
    fn get(&self, index: usize) -> Option<ResVitItem> {
        let (image_path, mask_path) = self.pairs.get(index)?;
        self.load(image_path, mask_path)
            .map_err(|err| tracing::warn!(%err, "failed to load sample {index}"))
            .ok()
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn find_mask(mask_root: &Path, image_path: &Path) -> Option<PathBuf> {
    let stem = image_path.file_stem()?.to_string_lossy();
    IMAGE_EXTENSIONS
        .iter()
        .flat_map(|ext| [ext.to_string(), ext.to_ascii_uppercase()])
        .map(|ext| mask_root.join(format!("{stem}.{ext}")))
        .find(|candidate| candidate.is_file())
}

fn open_resized(
    path: &Path,
    height: usize,
    width: usize,
    filter: FilterType,
) -> ResVitResult<DynamicImage> {
    let image = image::open(path).map_err(|e| ResVitError::Dataset {
        message: format!("Failed to open {}: {e}", path.display()),
    })?;
    Ok(image.resize_exact(width as u32, height as u32, filter))
}

/// Reorders interleaved pixels into channel planes.
fn hwc_to_chw(values: &[f32], channels: usize) -> Vec<f32> {
    (0..channels)
        .flat_map(|c| values.iter().skip(c).step_by(channels).copied())
        .collect()
}
