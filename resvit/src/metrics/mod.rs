//! Binary segmentation metrics.
//!
//! Predictions are thresholded into foreground/background and compared with
//! the ground truth mask pixel by pixel.

pub mod binary;
#[cfg(feature = "train")]
pub mod learner;

pub use binary::*;
#[cfg(feature = "train")]
pub use learner::*;
