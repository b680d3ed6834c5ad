//! Error types for nano-decode.

use thiserror::Error;

use crate::config::LogitsNormalization;

/// Result type alias for nano-decode operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-decode.
#[derive(Error, Debug)]
pub enum Error {
    /// The request queue is at capacity.
    #[error("request queue is full ({size}/{max})")]
    QueueFull { size: usize, max: usize },

    /// A request asked for a top-k the server was not configured for.
    #[error("top_k mismatch: server expects {expected}, request asked for {requested}")]
    TopKMismatch { expected: i32, requested: i32 },

    /// Not enough free KV cache pages.
    #[error("out of KV cache pages: need {required}, {available} available")]
    OutOfMemory { required: usize, available: usize },

    /// Request id is not tracked by the queue manager.
    #[error("request {0} not found")]
    NotFound(u64),

    /// A cache allocation was released twice.
    #[error("cache allocation {0} released twice")]
    DoubleRelease(u64),

    /// No mapping exists between two logits normalizations.
    #[error("unsupported logits conversion: {from:?} -> {to:?}")]
    UnsupportedConversion {
        from: LogitsNormalization,
        to: LogitsNormalization,
    },

    /// A beam had nothing to sample from.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// A completion signal was resolved more than once.
    #[error("completion signal already resolved")]
    SignalAlreadyResolved,

    /// Invalid beam state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Malformed request input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is an admission rejection the caller may retry.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::TopKMismatch { .. } | Self::OutOfMemory { .. }
        )
    }
}
