//! # Sharebox Protocol Library
//!
//! Wire-level definitions shared between the Sharebox share store and the
//! layers that call it (web front end, operator tooling).
//!
//! ## Overview
//!
//! - **Share tokens**: unguessable, URL-safe identifiers naming one share
//! - **Chunk upload messages**: the resumable upload request and response
//! - **Error codes**: machine-readable failure codes with HTTP mappings
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ChunkUpload, ChunkUploadResponse, ShareToken};
//!
//! let token = ShareToken::generate();
//! assert_eq!(token.as_str().len(), 43);
//!
//! let chunk = ChunkUpload::new("upload-1", token.as_str(), "photo.jpg", 1, 3, vec![0u8; 16]);
//! assert!(!chunk.is_last());
//!
//! let json = serde_json::to_string(&ChunkUploadResponse::pending()).unwrap();
//! assert_eq!(json, r#"{"done":false}"#);
//! ```
//!
//! ## Modules
//!
//! - [`token`]: Share token generation and parsing
//! - [`messages`]: Chunk upload messages and error codes
//! - [`error`]: Error types

pub mod error;
pub mod messages;
pub mod token;

pub use error::{ProtocolError, Result};
pub use messages::{ChunkUpload, ChunkUploadResponse, ErrorCode, ErrorResponse};
pub use token::{ShareToken, TOKEN_ENTROPY_BYTES, TOKEN_LENGTH};
