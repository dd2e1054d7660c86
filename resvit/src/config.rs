//! Detector configuration.
//!
//! Sub-configurations for the network pieces live beside the modules they
//! build; this module ties them together with the dataset and optimizer
//! sections into the single object the detector is constructed from.

mod core;

pub use self::core::*;
