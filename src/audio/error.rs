use crate::audio::hardware::HwError;
use std::io;
use symphonia::core::errors::Error as SymphoniaError;
use thiserror::Error;

/// Error types surfaced by the audio runtime.
#[derive(Debug, Error)]
pub enum AudioError {
    /// Context not current, duplicate name, stale handle, destroyed object.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    /// No free hardware voice and nothing evictable.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Decoding produced no sample frames.
    #[error("Empty resource: {0}")]
    EmptyResource(String),
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    /// A background load finished in the failed state.
    #[error("Load failed: {0}")]
    LoadFailed(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
    #[error("Hardware error: {0}")]
    Hardware(#[from] HwError),
}

impl From<io::Error> for AudioError {
    fn from(e: io::Error) -> Self {
        AudioError::IoError(e.to_string())
    }
}

impl From<SymphoniaError> for AudioError {
    fn from(e: SymphoniaError) -> Self {
        AudioError::DecodingError(e.to_string())
    }
}
