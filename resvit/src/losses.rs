//! Loss functions used to train the detector.

mod bce;
mod bundle;
mod dice;
mod l1;

pub use bce::{BceLoss, BceLossConfig};
pub use bundle::LossBundle;
pub use dice::{DiceLoss, DiceLossConfig};
pub use l1::L1Loss;
