//! Frame Header Implementation
//!
//! The header is identical for every frame and tells the reader how many
//! bytes follow it.
//!
//! ```text
//! ┌──────────┬─────────┬──────┬───────┬────┬──────────┐
//! │ magic(4) │ ver(1)  │ flag │ mtype │ ss │ psize(4) │
//! │ "FPNN"   │         │ (1)  │ (1)   │(1) │ LE u32   │
//! └──────────┴─────────┴──────┴───────┴────┴──────────┘
//! ```
//!
//! `ss` is the method name length on ONEWAY/TWOWAY quests and the answer
//! status on ANSWER frames.

use crate::error::{ProtocolError, ProtocolResult};
use crate::{
    FLAG_MSGPACK, HEADER_SIZE, MAGIC, MAX_METHOD_LEN, MAX_PAYLOAD_LEN, PROTOCOL_VERSION,
    SEQUENCE_SIZE,
};

/// Frame kind carried in the `mtype` byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Quest with no answer expected; carries no sequence number
    Oneway = 0,
    /// Quest awaiting an answer correlated by sequence number
    Twoway = 1,
    /// Answer to a prior TWOWAY quest
    Answer = 2,
}

impl MessageType {
    /// Whether a 4-byte sequence number follows the header
    pub fn has_sequence(self) -> bool {
        !matches!(self, MessageType::Oneway)
    }

    /// Whether `ss` bytes of method name follow the header (and sequence)
    pub fn has_method(self) -> bool {
        !matches!(self, MessageType::Answer)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> ProtocolResult<Self> {
        match value {
            0 => Ok(MessageType::Oneway),
            1 => Ok(MessageType::Twoway),
            2 => Ok(MessageType::Answer),
            mtype => Err(ProtocolError::UnknownMessageType { mtype }),
        }
    }
}

/// Fixed 12-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flag: u8,
    pub message_type: MessageType,
    /// Method length for quests, status for answers
    pub ss: u8,
    pub payload_size: u32,
}

impl Header {
    /// Header size in bytes
    pub const SIZE: usize = HEADER_SIZE;

    /// Build a quest header, refusing any field that would be truncated on the wire
    pub fn quest(
        message_type: MessageType,
        method_len: usize,
        payload_len: usize,
    ) -> ProtocolResult<Self> {
        if method_len > MAX_METHOD_LEN {
            return Err(ProtocolError::method_too_long(method_len));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::payload_too_large(payload_len));
        }

        Ok(Self {
            version: PROTOCOL_VERSION,
            flag: FLAG_MSGPACK,
            message_type,
            ss: method_len as u8,
            payload_size: payload_len as u32,
        })
    }

    /// Build an answer header with the given status byte
    pub fn answer(status: u8, payload_len: usize) -> ProtocolResult<Self> {
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::payload_too_large(payload_len));
        }

        Ok(Self {
            version: PROTOCOL_VERSION,
            flag: FLAG_MSGPACK,
            message_type: MessageType::Answer,
            ss: status,
            payload_size: payload_len as u32,
        })
    }

    /// Serialize to the fixed wire layout
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&MAGIC);
        out[4] = self.version;
        out[5] = self.flag;
        out[6] = self.message_type as u8;
        out[7] = self.ss;
        out[8..12].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    /// Parse the fixed header from the start of `data`
    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::truncated(HEADER_SIZE, data.len(), "header"));
        }

        let magic = [data[0], data[1], data[2], data[3]];
        if magic != MAGIC {
            return Err(ProtocolError::invalid_magic(magic));
        }

        Ok(Self {
            version: data[4],
            flag: data[5],
            message_type: MessageType::try_from(data[6])?,
            ss: data[7],
            payload_size: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Number of bytes following the header: sequence, method and payload
    pub fn body_len(&self) -> usize {
        let mut len = self.payload_size as usize;
        if self.message_type.has_sequence() {
            len += SEQUENCE_SIZE;
        }
        if self.message_type.has_method() {
            len += self.ss as usize;
        }
        len
    }

    /// Total frame size including the header
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    pub fn is_msgpack(&self) -> bool {
        self.flag & FLAG_MSGPACK != 0
    }
}
