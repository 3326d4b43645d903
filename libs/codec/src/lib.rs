//! # FPNN Protocol Codec
//!
//! ## Purpose
//!
//! The "rules" layer of the FPNN client: the fixed header layout, quest and
//! answer frame construction, encrypted envelope prefixing, and strict frame
//! parsing. Payloads are opaque bytes here; their MessagePack encoding is the
//! network crate's concern.
//!
//! ## Architecture Role
//!
//! ```text
//! [codec] → network/
//!    ↓          ↓
//! Header     Connection, cipher,
//! Quest      correlation table,
//! Frame      client dispatch
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket I/O or connection handling
//! - Encryption (only the envelope length prefix lives here)
//! - Sequence number allocation

pub mod builder;
pub mod constants;
pub mod error;
pub mod header;
pub mod parser;

pub use builder::{encode_answer, envelope_len, wrap_envelope, Quest};
pub use constants::*;
pub use error::{ProtocolError, ProtocolResult};
pub use header::{Header, MessageType};
pub use parser::{decode_frame, Frame};
