//! # Protocol Constants
//!
//! Fixed values of the FPNN wire format. These must stay byte-for-byte stable:
//! every peer speaking the protocol validates the magic and interprets the
//! flag and message type bytes with exactly these meanings.

/// Protocol identification literal, the first four bytes of every plaintext frame
pub const MAGIC: [u8; 4] = *b"FPNN";

/// Protocol version written by this client
pub const PROTOCOL_VERSION: u8 = 1;

/// Flag bit marking the payload as MessagePack encoded (always set by this client)
pub const FLAG_MSGPACK: u8 = 0x80;

/// Size of the fixed header: magic(4) | version(1) | flag(1) | mtype(1) | ss(1) | psize(4)
pub const HEADER_SIZE: usize = 12;

/// Size of the little-endian sequence number following the header of TWOWAY and ANSWER frames
pub const SEQUENCE_SIZE: usize = 4;

/// Size of the little-endian length prefix of an encrypted envelope
pub const ENVELOPE_PREFIX_SIZE: usize = 4;

/// Longest method name the single `ss` byte can describe
pub const MAX_METHOD_LEN: usize = u8::MAX as usize;

/// Largest payload the 32-bit `psize` field can describe
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize;

/// Reserved control method carrying the key exchange
pub const KEY_EXCHANGE_METHOD: &str = "*key";

/// Largest sequence number before the generator wraps back to 1
pub const MAX_SEQUENCE: u32 = i32::MAX as u32;
