//! # Frame Parser
//!
//! ## Purpose
//!
//! Parses one complete plaintext frame. The caller is responsible for reading
//! exactly one frame off the wire first: for the plaintext transport that is
//! [`Header::SIZE`] bytes followed by [`Header::body_len`] bytes; for the
//! encrypted transport it is the decrypted content of one envelope.
//!
//! Parsing is strict: the buffer must hold exactly the bytes the header
//! declares, no fewer and no more.

use crate::error::{ProtocolError, ProtocolResult};
use crate::header::{Header, MessageType};
use crate::{HEADER_SIZE, SEQUENCE_SIZE};

/// A decoded frame of any message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    /// Present for TWOWAY quests and answers
    pub sequence: Option<u32>,
    /// Present for ONEWAY and TWOWAY quests
    pub method: Option<String>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn is_answer(&self) -> bool {
        self.header.message_type == MessageType::Answer
    }

    /// Answer status byte, `None` for quests
    pub fn answer_status(&self) -> Option<u8> {
        self.is_answer().then_some(self.header.ss)
    }
}

/// Parse a complete plaintext frame
pub fn decode_frame(data: &[u8]) -> ProtocolResult<Frame> {
    let header = Header::decode(data)?;

    let declared = header.frame_len();
    if data.len() < declared {
        return Err(ProtocolError::truncated(declared, data.len(), "frame body"));
    }
    if data.len() > declared {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }

    let mut offset = HEADER_SIZE;

    let sequence = if header.message_type.has_sequence() {
        let seq = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        offset += SEQUENCE_SIZE;
        Some(seq)
    } else {
        None
    };

    let method = if header.message_type.has_method() {
        let end = offset + header.ss as usize;
        let name = std::str::from_utf8(&data[offset..end]).map_err(|e| {
            ProtocolError::InvalidMethod {
                offset,
                reason: e.to_string(),
            }
        })?;
        offset = end;
        Some(name.to_string())
    } else {
        None
    };

    Ok(Frame {
        header,
        sequence,
        method,
        payload: data[offset..].to_vec(),
    })
}
