//! # Frame Builder - Quest and Answer Construction
//!
//! ## Purpose
//!
//! Builds complete plaintext frames ready for the transport. A [`Quest`] is
//! validated once at construction, so encoding it afterwards cannot fail and
//! always produces exactly one frame.
//!
//! ```text
//! Client → [Quest::twoway] → encode() → (optional cipher + envelope) → socket
//! ```
//!
//! Plaintext layout:
//! `header(12) | seq(4, LE, TWOWAY/ANSWER only) | method(ss) | payload(psize)`

use crate::error::{ProtocolError, ProtocolResult};
use crate::header::{Header, MessageType};
use crate::{ENVELOPE_PREFIX_SIZE, HEADER_SIZE, SEQUENCE_SIZE};
use std::time::{SystemTime, UNIX_EPOCH};

/// Outbound request frame, immutable once constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quest {
    header: Header,
    sequence: Option<u32>,
    method: String,
    payload: Vec<u8>,
    created_at_ms: u64,
}

impl Quest {
    /// Build a ONEWAY quest; no sequence number is assigned or written
    pub fn oneway(method: impl Into<String>, payload: Vec<u8>) -> ProtocolResult<Self> {
        Self::build(MessageType::Oneway, None, method.into(), payload)
    }

    /// Build a TWOWAY quest carrying `sequence`
    pub fn twoway(
        method: impl Into<String>,
        payload: Vec<u8>,
        sequence: u32,
    ) -> ProtocolResult<Self> {
        Self::build(MessageType::Twoway, Some(sequence), method.into(), payload)
    }

    fn build(
        message_type: MessageType,
        sequence: Option<u32>,
        method: String,
        payload: Vec<u8>,
    ) -> ProtocolResult<Self> {
        let header = Header::quest(message_type, method.len(), payload.len())?;
        Ok(Self {
            header,
            sequence,
            method,
            payload,
            created_at_ms: now_ms(),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Sequence number, `None` for ONEWAY quests
    pub fn sequence(&self) -> Option<u32> {
        self.sequence
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Creation time in milliseconds since the Unix epoch
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn is_twoway(&self) -> bool {
        self.header.message_type == MessageType::Twoway
    }

    /// Encode to the plaintext wire frame
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.header.frame_len());
        frame.extend_from_slice(&self.header.encode());
        if let Some(seq) = self.sequence {
            frame.extend_from_slice(&seq.to_le_bytes());
        }
        frame.extend_from_slice(self.method.as_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Encode an ANSWER frame for `sequence` with the given status byte
pub fn encode_answer(sequence: u32, status: u8, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    let header = Header::answer(status, payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + SEQUENCE_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&sequence.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Prefix ciphertext with its little-endian length for the encrypted transport
pub fn wrap_envelope(ciphertext: &[u8]) -> ProtocolResult<Vec<u8>> {
    let len = u32::try_from(ciphertext.len())
        .map_err(|_| ProtocolError::payload_too_large(ciphertext.len()))?;
    let mut out = Vec::with_capacity(ENVELOPE_PREFIX_SIZE + ciphertext.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Read the ciphertext length from an envelope prefix
pub fn envelope_len(prefix: [u8; ENVELOPE_PREFIX_SIZE]) -> usize {
    u32::from_le_bytes(prefix) as usize
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
