//! Client Error Types
//!
//! One taxonomy for everything that can go wrong between a caller handing
//! over a quest and the answer (or failure) coming back: framing, cipher,
//! socket, per-quest timeout, correlation invariants, configuration and
//! payload encoding.

use codec::ProtocolError;
use std::net::SocketAddr;
use thiserror::Error;

/// Main client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// Malformed, truncated or oversized frame
    #[error("Frame error: {0}")]
    Frame(#[from] ProtocolError),

    /// Handshake, key derivation or per-frame cipher failure
    #[error("Cipher error: {message}")]
    Cipher {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Socket-level failure; every quest in flight on the socket fails with this
    #[error("Connection broken: {message} (remote: {remote_addr:?})")]
    ConnectionBroken {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Quest exceeded its deadline before an answer arrived
    #[error("Quest timeout: seq {sequence} ({method}) exceeded {timeout_ms}ms")]
    Timeout {
        sequence: u32,
        method: String,
        timeout_ms: u64,
    },

    /// Sequence number already present in the correlation table
    #[error("Duplicate sequence number {sequence} in correlation table")]
    DuplicateKey { sequence: u32 },

    /// Operation attempted on a closed client
    #[error("Client is closed")]
    Closed,

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// MessagePack encode/decode of quest arguments or answer payloads
    #[error("Payload error: {message}")]
    Payload {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Peer answered with a non-zero status
    #[error("Answer error: status {status}, code {code}: {ex}")]
    Answer { status: u8, code: i64, ex: String },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Create a cipher error
    pub fn cipher(message: impl Into<String>) -> Self {
        Self::Cipher {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cipher error with source
    pub fn cipher_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Cipher {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection broken error
    pub fn connection_broken(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::ConnectionBroken {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection broken error with source
    pub fn connection_broken_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConnectionBroken {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(sequence: u32, method: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            sequence,
            method: method.into(),
            timeout_ms,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a payload error with source
    pub fn payload_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Payload {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Whether the error invalidates the socket it occurred on
    ///
    /// Encoding failures of an outbound quest are local to that quest and
    /// leave the connection usable.
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            ClientError::Frame(e) => !e.is_encoding(),
            ClientError::Cipher { .. } => true,
            ClientError::ConnectionBroken { .. } => true,
            ClientError::Io { .. } => true,
            ClientError::Timeout { .. } => false,
            ClientError::DuplicateKey { .. } => false,
            ClientError::Closed => false,
            ClientError::Configuration { .. } => false,
            ClientError::Payload { .. } => false,
            ClientError::Answer { .. } => false,
        }
    }

    /// Check if resending the same quest could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionBroken { .. }
                | ClientError::Timeout { .. }
                | ClientError::Io { .. }
        )
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// Check if this is a broken connection error
    pub fn is_connection_broken(&self) -> bool {
        matches!(self, ClientError::ConnectionBroken { .. })
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::io("I/O operation failed", err)
    }
}

impl From<config_crate::ConfigError> for ClientError {
    fn from(err: config_crate::ConfigError) -> Self {
        Self::configuration(err.to_string(), None)
    }
}
