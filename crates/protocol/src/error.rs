//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering parsing and encoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Token text is not a valid share token.
    #[error("invalid share token: {0}")]
    InvalidToken(String),

    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidToken("../etc".to_string());
        assert_eq!(err.to_string(), "invalid share token: ../etc");
    }

    #[test]
    fn test_json_syntax_error_maps_to_deserialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(
            ProtocolError::from(err),
            ProtocolError::Deserialization(_)
        ));
    }
}
