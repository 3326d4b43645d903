//! Protocol-level errors for FPNN frame processing
//!
//! Covers both directions: encoding failures (a field would not fit its wire
//! width) and frame failures (a received buffer is not a valid frame). Every
//! variant carries enough context to tell a framing bug from line corruption.

use thiserror::Error;

/// Frame encoding and parsing errors with diagnostic context
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Method name does not fit the single length byte
    #[error("Method name too long: {len} bytes exceeds limit {limit}")]
    MethodTooLong { len: usize, limit: usize },

    /// Payload does not fit the 32-bit length field
    #[error("Payload too large: {len} bytes exceeds limit {limit}")]
    PayloadTooLarge { len: usize, limit: usize },

    /// Buffer ends before the frame it describes
    #[error("Truncated frame: need {need} bytes, got {got} (context: {context})")]
    Truncated {
        need: usize,
        got: usize,
        context: String,
    },

    /// Protocol magic validation failed
    #[error("Invalid magic: expected {expected:?}, got {actual:?} (indicates: {diagnosis})")]
    InvalidMagic {
        expected: [u8; 4],
        actual: [u8; 4],
        diagnosis: String,
    },

    /// Message type byte is not ONEWAY, TWOWAY or ANSWER
    #[error("Unknown message type {mtype}: valid types are 0 (oneway), 1 (twoway), 2 (answer)")]
    UnknownMessageType { mtype: u8 },

    /// Declared frame exceeds the reader's configured limit
    #[error("Frame too large: {size} bytes exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Buffer carries bytes beyond what the header declares
    #[error("Frame length mismatch: header declares {declared} bytes, buffer has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Method name bytes are not valid UTF-8
    #[error("Invalid method name at offset {offset}: {reason}")]
    InvalidMethod { offset: usize, reason: String },
}

impl ProtocolError {
    pub fn method_too_long(len: usize) -> Self {
        Self::MethodTooLong {
            len,
            limit: crate::MAX_METHOD_LEN,
        }
    }

    pub fn payload_too_large(len: usize) -> Self {
        Self::PayloadTooLarge {
            len,
            limit: crate::MAX_PAYLOAD_LEN,
        }
    }

    pub fn frame_too_large(size: usize, limit: usize) -> Self {
        Self::FrameTooLarge { size, limit }
    }

    /// Create a Truncated error with the parsing step that ran out of bytes
    pub fn truncated(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::Truncated {
            need,
            got,
            context: context.into(),
        }
    }

    /// Create an InvalidMagic error with a best guess at the cause
    pub fn invalid_magic(actual: [u8; 4]) -> Self {
        let diagnosis = match actual {
            [0, 0, 0, 0] => "uninitialized buffer",
            _ if actual.iter().rev().eq(crate::MAGIC.iter()) => "byte order mismatch",
            _ => "encrypted frame read as plaintext or stream desynchronized",
        };

        Self::InvalidMagic {
            expected: crate::MAGIC,
            actual,
            diagnosis: diagnosis.to_string(),
        }
    }

    /// Whether the error was produced while building an outbound frame
    pub fn is_encoding(&self) -> bool {
        matches!(
            self,
            ProtocolError::MethodTooLong { .. } | ProtocolError::PayloadTooLarge { .. }
        )
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
