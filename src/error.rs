//! Error types for calo-transformer operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaloError {
    /// Invalid hyperparameter type or range, raised at component construction.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Batch-size or feature-depth mismatch, raised before any tensor computation.
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// A loss-strategy method was invoked on the abstract base.
    #[error("Not implemented: only concrete loss variants provide `{0}`")]
    NotImplemented(&'static str),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaloError {
    /// Shorthand for a feature-depth/batch-size mismatch.
    pub fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}
