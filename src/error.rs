//! Error types for peftkit.

use thiserror::Error;

/// Result type alias for peftkit operations.
pub type Result<T> = std::result::Result<T, PeftError>;

/// Errors that can occur in peftkit operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PeftError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dimension mismatch.
    #[error("dimension mismatch: {message}")]
    DimensionMismatch {
        /// Descriptive message
        message: String,
    },

    /// Adapter not found.
    #[error("adapter not found: {name}")]
    AdapterNotFound {
        /// Name of the missing adapter
        name: String,
    },

    /// Adapter already exists.
    #[error("adapter already exists: {name}")]
    AdapterExists {
        /// Name of the duplicate adapter
        name: String,
    },

    /// None of the configured target modules exist in the base model.
    #[error("target modules {targets:?} not found in the base model")]
    TargetNotFound {
        /// Configured targets
        targets: Vec<String>,
    },

    /// Operation is not allowed while the adapter is merged into the base weight.
    #[error("adapter '{name}' is merged; unmerge it first")]
    AdapterMerged {
        /// Name of the merged adapter
        name: String,
    },

    /// Merging produced NaN or infinite values.
    #[error("merging adapter '{name}' produced non-finite weights in module '{module}'")]
    NonFinite {
        /// Adapter being merged
        name: String,
        /// Module whose weight broke
        module: String,
    },

    /// Weight loading error.
    #[error("failed to load weights: {0}")]
    WeightLoad(String),

    /// Filesystem error.
    #[error("i/o error: {0}")]
    Io(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl From<std::io::Error> for PeftError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
