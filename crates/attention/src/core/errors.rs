//! Error types emitted by attention kernels and the validation harness.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A scalar argument (scale, window, descale, range) is out of bounds.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A backend-specific failure propagated to the caller.
    #[error("{message}")]
    Backend { message: String },
    /// Harness configuration could not be parsed or failed validation.
    #[error("invalid harness configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AttentionError {
    pub fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;
