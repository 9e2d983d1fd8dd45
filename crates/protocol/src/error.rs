//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering payload encoding and decoding failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload ended before a field could be read.
    #[error("payload truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required to decode the next field.
        needed: usize,
        /// Bytes left in the payload.
        available: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(String),

    /// Payload carried bytes past the last known field.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// The request type is not one this crate can decode.
    #[error("unknown request type: {0}")]
    UnknownRequest(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
