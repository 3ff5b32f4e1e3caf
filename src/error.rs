//! Error types for the capture pipeline
//!
//! Every stage reports failures through [`Error`]. The variants follow the
//! pipeline's error taxonomy so callers can tell configuration problems from
//! per-frame losses and from structural failures.

use thiserror::Error;

/// Main error type for the capture pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid parameter or configuration value.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation requires an initialized module.
    #[error("Module not initialized")]
    NotInitialized,

    /// `init` was issued twice.
    #[error("Module already initialized")]
    AlreadyInitialized,

    /// Lifecycle operation issued from a state that does not allow it.
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// The platform refused access to a device or file.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Platform feature or codec not supported.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Captured content is DRM protected.
    #[error("Content is DRM protected")]
    DrmProtected,

    /// Codec library failed to encode.
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// Allocation failed.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded wait elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// Anything that does not fit the categories above.
    #[error("{0}")]
    Unknown(String),
}

/// Copyable classification of an [`Error`], used for counters and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    NotInitialized,
    AlreadyInitialized,
    InvalidState,
    PermissionDenied,
    Unsupported,
    DrmProtected,
    Encoding,
    OutOfMemory,
    Io,
    Timeout,
    Unknown,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::NotInitialized => ErrorKind::NotInitialized,
            Error::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::DrmProtected => ErrorKind::DrmProtected,
            Error::Encoding(_) => ErrorKind::Encoding,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::Io(_) => ErrorKind::Io,
            Error::Timeout => ErrorKind::Timeout,
            Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        Error::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidParameter(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(e: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory(e.to_string())
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ac_ffmpeg::Error> for Error {
    fn from(e: ac_ffmpeg::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

/// Result type alias using the pipeline [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
