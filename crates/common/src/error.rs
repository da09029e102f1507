use thiserror::Error;

use crate::retry::RetryExhausted;

/// A configuration field that could not be accepted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failures surfaced by camera sessions, the registry and the recorder.
///
/// Per-camera failures are always reported with the camera identity attached
/// by the caller; none of these abort sibling cameras.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("stream read failed: {0}")]
    StreamRead(String),

    #[error("ptz command failed: {0}")]
    PtzCommand(String),

    #[error("recording could not start: {0}")]
    RecordingStart(String),

    #[error("recording write failed: {0}")]
    RecordingWrite(String),

    #[error("camera not found: {0}")]
    CameraNotFound(String),

    #[error(transparent)]
    RetryExhausted(#[from] RetryExhausted),
}

impl CameraError {
    pub fn not_found(identity: impl Into<String>) -> Self {
        Self::CameraNotFound(identity.into())
    }

    /// Stream read failures are transient and lead to a reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::StreamRead(_))
    }
}
