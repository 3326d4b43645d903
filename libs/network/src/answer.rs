//! Answers and MessagePack payload helpers

use crate::error::{ClientError, Result};
use bytes::Bytes;
use codec::Frame;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Encode quest arguments as a MessagePack map
pub fn encode_payload<T: Serialize + ?Sized>(args: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(args)
        .map_err(|e| ClientError::payload_with_source("failed to encode arguments", e))
}

/// Decode a MessagePack payload
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    rmp_serde::from_slice(payload)
        .map_err(|e| ClientError::payload_with_source("failed to decode payload", e))
}

/// Body of a non-zero status answer
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    ex: String,
}

/// Answer to a TWOWAY quest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    sequence: u32,
    status: u8,
    payload: Bytes,
}

impl Answer {
    pub fn new(sequence: u32, status: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            status,
            payload: payload.into(),
        }
    }

    /// Build from a decoded ANSWER frame; `None` for quests
    pub fn from_frame(frame: Frame) -> Option<Self> {
        let status = frame.answer_status()?;
        let sequence = frame.sequence?;
        Some(Self::new(sequence, status, frame.payload))
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    /// Raw MessagePack payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_error(&self) -> bool {
        self.status != 0
    }

    /// Decode the payload into `T`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.payload)
    }

    /// Turn a non-zero status into `ClientError::Answer`
    pub fn into_result(self) -> Result<Answer> {
        if !self.is_error() {
            return Ok(self);
        }

        let body: ErrorBody = decode_payload(&self.payload).unwrap_or_default();
        Err(ClientError::Answer {
            status: self.status,
            code: body.code,
            ex: body.ex,
        })
    }
}
