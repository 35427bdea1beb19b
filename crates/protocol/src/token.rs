//! Share token generation and parsing.
//!
//! A share token names one share. It is used both as the registry primary key
//! and as the name of the share's storage directory, so a parsed token is
//! guaranteed to contain only URL-safe base64 characters.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Number of random bytes behind a freshly generated token.
pub const TOKEN_ENTROPY_BYTES: usize = 32;

/// Encoded length of a freshly generated token (32 bytes, unpadded base64).
pub const TOKEN_LENGTH: usize = 43;

/// Shortest token text accepted by [`ShareToken::parse`].
pub const MIN_TOKEN_LENGTH: usize = 16;

/// Longest token text accepted by [`ShareToken::parse`].
pub const MAX_TOKEN_LENGTH: usize = 128;

/// An unguessable share identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShareToken(String);

impl ShareToken {
    /// Generates a new token from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parses token text received from a caller.
    ///
    /// Only the URL-safe base64 alphabet is accepted, which rules out path
    /// separators, dots and anything else that could escape a directory.
    pub fn parse(text: &str) -> Result<Self> {
        let len = text.len();
        if !(MIN_TOKEN_LENGTH..=MAX_TOKEN_LENGTH).contains(&len) {
            return Err(ProtocolError::InvalidToken(truncate(text)));
        }
        if !text.bytes().all(is_token_byte) {
            return Err(ProtocolError::InvalidToken(truncate(text)));
        }
        Ok(Self(text.to_string()))
    }

    /// Returns the token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix suitable for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn truncate(text: &str) -> String {
    text.chars().take(32).collect()
}

impl fmt::Display for ShareToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ShareToken {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ShareToken {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ShareToken> for String {
    fn from(token: ShareToken) -> Self {
        token.0
    }
}

impl AsRef<str> for ShareToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
