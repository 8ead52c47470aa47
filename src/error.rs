//! Error types for rust_scnorm

use thiserror::Error;

/// Main error type for size factor estimation and normalization
#[derive(Error, Debug)]
pub enum ScnormError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Insufficient data: {reason}")]
    InsufficientData { reason: String },

    #[error("Singular linear system: {reason}")]
    SingularSystem { reason: String },

    #[error("Time limit exceeded during {stage} after {elapsed_ms} ms")]
    Timeout { stage: String, elapsed_ms: u128 },

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Thread pool construction failed: {reason}")]
    ThreadPool { reason: String },
}

impl ScnormError {
    /// True for errors caused by malformed inputs, which are never retried
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            ScnormError::InvalidInput { .. } | ScnormError::DimensionMismatch { .. }
        )
    }
}

/// Result type alias for rust_scnorm operations
pub type Result<T> = std::result::Result<T, ScnormError>;
