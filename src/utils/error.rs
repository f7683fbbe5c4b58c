//! Error types and handling
//!
//! Common error types used across the application, plus the status taxonomy
//! that recoverable failures are reported under.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),

    #[error("Recording error: {0}")]
    Recording(#[from] crate::recorder::RecordingError),

    #[error("Detection error: {0}")]
    Detection(#[from] crate::detection::DetectionError),
}

/// Kinds of recoverable failure surfaced to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Camera or audio device missing or busy at open
    SourceUnavailable,
    /// Read failure after a successful open
    StreamInterrupted,
    /// Learned model unusable, heuristic scoring in use
    ClassificationDegraded,
    /// A camera dropped while a clip was being collected
    PartialCapture,
    /// Disk write or rename failed while persisting a clip or metadata
    PersistenceFailure,
    /// Trigger arrived while a clip was already being assembled
    OverlappingTrigger,
}

impl ErrorKind {
    /// Stable code for the presentation layer
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "SOURCE_UNAVAILABLE",
            ErrorKind::StreamInterrupted => "STREAM_INTERRUPTED",
            ErrorKind::ClassificationDegraded => "CLASSIFICATION_DEGRADED",
            ErrorKind::PartialCapture => "PARTIAL_CAPTURE",
            ErrorKind::PersistenceFailure => "PERSISTENCE_FAILURE",
            ErrorKind::OverlappingTrigger => "OVERLAPPING_TRIGGER",
        }
    }
}

/// Error response for the presentation layer
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Capture(e) => e.kind().code(),
            AppError::Recording(_) => ErrorKind::PersistenceFailure.code(),
            AppError::Detection(_) => ErrorKind::ClassificationDegraded.code(),
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
