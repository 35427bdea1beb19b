//! Error taxonomy for share store operations.

use protocol::{ErrorCode, ErrorResponse, ProtocolError};
use thiserror::Error;

/// Errors returned by the registry, object store, chunk assembler and the
/// share service.
#[derive(Debug, Error)]
pub enum ShareError {
    /// Unknown or deleted token, or a file not recorded for the token.
    #[error("not found: {0}")]
    NotFound(String),

    /// The token exists but its deadline has passed.
    #[error("share expired: {0}")]
    Expired(String),

    /// Chunk index outside `1..=total`, or a non-positive total.
    #[error("invalid chunk index {index} of {total}")]
    InvalidChunkIndex { index: u32, total: u32 },

    /// Assembly found a chunk missing from staging.
    #[error("upload {session} is incomplete: chunk {missing} is missing")]
    IncompleteUpload { session: String, missing: u32 },

    /// Filename sanitization left nothing safe to store.
    #[error("filename rejected: {0:?}")]
    PathTraversalRejected(String),

    /// Upload session identifier is not usable as a staging key.
    #[error("invalid upload session id: {0:?}")]
    InvalidSessionId(String),

    /// Retention must be at least one hour.
    #[error("retention must be at least 1 hour, got {0}")]
    InvalidRetention(u32),

    /// Token text could not be parsed.
    #[error("invalid share token: {0}")]
    InvalidToken(String),

    /// Backing store (SQLite or filesystem) failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for share store operations.
pub type ShareResult<T> = Result<T, ShareError>;

impl ShareError {
    /// Machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ShareError::NotFound(_) => ErrorCode::NotFound,
            ShareError::Expired(_) => ErrorCode::Expired,
            ShareError::InvalidChunkIndex { .. } => ErrorCode::InvalidChunkIndex,
            ShareError::IncompleteUpload { .. } => ErrorCode::IncompleteUpload,
            ShareError::PathTraversalRejected(_) => ErrorCode::PathTraversalRejected,
            ShareError::InvalidSessionId(_) => ErrorCode::InvalidSessionId,
            ShareError::InvalidRetention(_) => ErrorCode::InvalidRetention,
            ShareError::InvalidToken(_) => ErrorCode::InvalidToken,
            ShareError::Storage(_) => ErrorCode::StorageError,
        }
    }

    /// Converts into the error body sent to callers.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}

impl From<rusqlite::Error> for ShareError {
    fn from(err: rusqlite::Error) -> Self {
        ShareError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ShareError {
    fn from(err: std::io::Error) -> Self {
        ShareError::Storage(err.to_string())
    }
}

impl From<ProtocolError> for ShareError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidToken(token) => ShareError::InvalidToken(token),
            other => ShareError::Storage(other.to_string()),
        }
    }
}
