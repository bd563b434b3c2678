//! Error types for Speedplay.

use thiserror::Error;

use crate::types::PlaybackState;

/// Result type alias using Speedplay's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Speedplay.
#[derive(Error, Debug)]
pub enum Error {
    // Programmer errors
    #[error("Must not call {operation} in state {state:?}")]
    IllegalState {
        operation: &'static str,
        state: PlaybackState,
    },

    // Source errors
    #[error("Source error: {0}")]
    Source(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Audio output error: {0}")]
    AudioOutput(String),

    // Codec errors
    #[error("Codec error: {0}")]
    Codec(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if this error reports an operation called in the wrong state.
    pub const fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }

    /// Returns true if this error belongs to the configuration class
    /// (missing format keys, unsupported layout, device setup).
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::AudioOutput(_))
    }
}
