//! Error types shared across Splice crates.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for Splice operations.
#[derive(Debug, thiserror::Error)]
pub enum SpliceError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Configuration conflict: {message}")]
    ConfigurationConflict { message: String },

    #[error("Resource error: {message}")]
    Resource { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Encode error: {message}")]
    Encode {
        message: String,
        /// Tail of the external process diagnostics (stderr).
        diagnostics: String,
    },

    #[error("Export cancelled")]
    Cancelled,

    #[error("Export session {id} is already active")]
    SessionAlreadyActive { id: String },

    #[error("Export session {id} not found")]
    SessionNotFound { id: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using SpliceError.
pub type SpliceResult<T> = Result<T, SpliceError>;

/// User-facing failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Resource,
    Encode,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Resource => "resource",
            ErrorKind::Encode => "encode",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SpliceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConfigurationConflict {
            message: msg.into(),
        }
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource {
            message: msg.into(),
        }
    }

    pub fn encode(msg: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self::Encode {
            message: msg.into(),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Taxonomy bucket reported to users alongside the message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpliceError::Validation { .. } | SpliceError::ConfigurationConflict { .. } => {
                ErrorKind::Validation
            }
            SpliceError::Resource { .. } | SpliceError::FileNotFound { .. } => {
                ErrorKind::Resource
            }
            SpliceError::Encode { .. } => ErrorKind::Encode,
            SpliceError::Cancelled => ErrorKind::Cancelled,
            SpliceError::Io(_) => ErrorKind::Resource,
            SpliceError::SessionAlreadyActive { .. }
            | SpliceError::SessionNotFound { .. }
            | SpliceError::Config { .. }
            | SpliceError::Json(_)
            | SpliceError::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SpliceError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(SpliceError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(SpliceError::conflict("x").kind(), ErrorKind::Validation);
        assert_eq!(SpliceError::resource("x").kind(), ErrorKind::Resource);
        assert_eq!(
            SpliceError::FileNotFound {
                path: PathBuf::from("/missing.mp4")
            }
            .kind(),
            ErrorKind::Resource
        );
        assert_eq!(SpliceError::encode("x", "").kind(), ErrorKind::Encode);
        assert_eq!(SpliceError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_encode_message_excludes_diagnostics() {
        let err = SpliceError::encode("ffmpeg exited with status 1", "Invalid argument");
        assert_eq!(err.to_string(), "Encode error: ffmpeg exited with status 1");
    }
}
