//! Wire message definitions for Sharebox.
//!
//! These are the types exchanged between the web layer and the share store:
//! the chunked upload request and its response, and the error body returned
//! when an operation is refused. They are serialized as JSON with camelCase
//! field names.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Chunked Upload
// ============================================================================

/// One chunk of a resumable upload.
///
/// The metadata fields arrive as form fields; the chunk bytes arrive as a
/// separate multipart part and are attached by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUpload {
    /// 1-based chunk index.
    pub chunk_number: u32,
    /// Total number of chunks in the upload.
    pub total_chunks: u32,
    /// Client-generated upload session identifier.
    pub file_id: String,
    /// Original filename, sanitized server-side.
    pub filename: String,
    /// Destination share token (must already exist).
    pub share_token: String,
    /// Raw chunk bytes.
    #[serde(skip)]
    pub data: Bytes,
}

impl ChunkUpload {
    /// Creates a chunk upload with the given metadata and payload.
    pub fn new(
        file_id: impl Into<String>,
        share_token: impl Into<String>,
        filename: impl Into<String>,
        chunk_number: u32,
        total_chunks: u32,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            chunk_number,
            total_chunks,
            file_id: file_id.into(),
            filename: filename.into(),
            share_token: share_token.into(),
            data: data.into(),
        }
    }

    /// Returns true if this is the highest-numbered chunk of the upload.
    pub fn is_last(&self) -> bool {
        self.chunk_number == self.total_chunks
    }
}

/// Response to a chunk upload.
///
/// Serializes to `{"done": false}` while chunks are outstanding and to
/// `{"done": true, "token": "..."}` once the file has been assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUploadResponse {
    /// Whether the upload is complete.
    pub done: bool,
    /// Share token the assembled file was recorded under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Name the file was stored under, after collision renaming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_name: Option<String>,
}

impl ChunkUploadResponse {
    /// More chunks are needed.
    pub fn pending() -> Self {
        Self {
            done: false,
            token: None,
            stored_name: None,
        }
    }

    /// The upload has been assembled.
    pub fn done(token: impl Into<String>, stored_name: impl Into<String>) -> Self {
        Self {
            done: true,
            token: Some(token.into()),
            stored_name: Some(stored_name.into()),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Machine-readable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown or deleted token or file.
    NotFound,
    /// Token exists but its deadline has passed.
    Expired,
    /// Chunk index or total out of range.
    InvalidChunkIndex,
    /// Assembly attempted while a chunk is missing.
    IncompleteUpload,
    /// Filename sanitization left nothing safe.
    PathTraversalRejected,
    /// Upload session identifier is malformed.
    InvalidSessionId,
    /// Retention period is out of range.
    InvalidRetention,
    /// Token text is malformed.
    InvalidToken,
    /// Backing store failure.
    StorageError,
}

impl ErrorCode {
    /// HTTP status the web layer should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::Expired => 410,
            ErrorCode::IncompleteUpload => 409,
            ErrorCode::InvalidChunkIndex
            | ErrorCode::PathTraversalRejected
            | ErrorCode::InvalidSessionId
            | ErrorCode::InvalidRetention
            | ErrorCode::InvalidToken => 400,
            ErrorCode::StorageError => 500,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::StorageError | ErrorCode::IncompleteUpload)
    }
}

/// Error body returned when an operation is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ErrorResponse {
    /// Creates a new error response.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
