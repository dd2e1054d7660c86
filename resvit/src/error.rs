use std::path::PathBuf;

use thiserror::Error;

/// The error type for ResViT detector operations.
///
/// Covers configuration problems caught at construction, checkpoint and
/// dataset I/O, and shape mismatches detected during the forward pass.
#[derive(Error, Debug)]
pub enum ResVitError {
    /// A configuration value is missing, out of range, or inconsistent with another.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// A configuration file could not be read or deserialized.
    #[error("Failed to load configuration from {path}: {reason}")]
    ConfigLoad {
        /// The configuration file.
        path: PathBuf,
        /// The underlying failure.
        reason: String,
    },

    /// An input tensor has an unexpected shape.
    #[error("Invalid input tensor shape: expected {expected}, got {actual}")]
    InvalidTensorShape {
        /// The expected shape.
        expected: String,
        /// The shape that was received.
        actual: String,
    },

    /// Tensor data could not be extracted or converted.
    #[error("Tensor operation failed: {operation}")]
    TensorOperationFailed {
        /// A description of the failed operation.
        operation: String,
    },

    /// A checkpoint file could not be read, parsed, or written.
    #[error("Checkpoint I/O failed for {path}: {reason}")]
    CheckpointIo {
        /// The checkpoint file.
        path: PathBuf,
        /// The underlying failure.
        reason: String,
    },

    /// A checkpoint tensor matched a parameter by name but not by shape.
    #[error("Checkpoint tensor `{name}` has shape {found:?}, parameter expects {expected:?}")]
    CheckpointShapeMismatch {
        /// Dotted parameter name.
        name: String,
        /// Shape of the model parameter.
        expected: Vec<usize>,
        /// Shape stored in the checkpoint.
        found: Vec<usize>,
    },

    /// Dataset discovery or loading failed.
    #[error("Dataset error: {message}")]
    Dataset {
        /// The error message.
        message: String,
    },
}

/// A specialized `Result` type for ResViT detector operations.
pub type ResVitResult<T> = Result<T, ResVitError>;
