// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for patchcast.

/// Errors that can occur while building a model or producing a forecast.
#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    /// Tensor operation or weight loading error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Model configuration inconsistency, fatal at construction time.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed checkpoint (unexpected tensor name or shape), fatal at load time.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid rollout arguments, fatal at the forecast call.
    #[error("rollout error: {0}")]
    Rollout(String),

    /// Kernel backend invoked on a device it does not support.
    #[error("backend error: {0}")]
    Backend(String),

    /// I/O error while reading a checkpoint.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for patchcast operations.
pub type Result<T> = std::result::Result<T, ForecastError>;
