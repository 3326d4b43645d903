//! FPNN Client Networking
//!
//! Everything stateful about talking to an FPNN server: the connection and
//! its reconnect state machine, the receive and sweep tasks, the correlation
//! table that pairs answers with waiters, the optional ECDH key exchange with
//! per-frame AES-CFB, and the [`Client`] dispatch API on top.
//!
//! ```no_run
//! use network::{Client, ClientConfig};
//! use std::collections::HashMap;
//!
//! # async fn demo() -> network::Result<()> {
//! let client = Client::new(ClientConfig::new("127.0.0.1", 13099))?;
//! let args = HashMap::from([("x", 1)]);
//! let answer = client.send_quest("echo", &args, None).await?;
//! let echoed: HashMap<String, i32> = answer.decode()?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod answer;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod security;
pub mod sequence;

pub use answer::{decode_payload, encode_payload, Answer};
pub use client::Client;
pub use config::{ClientConfig, EncryptionConfig};
pub use connection::{ConnectionState, ConnectionStats};
pub use correlation::{AnswerCallback, CorrelationTable, Waiter};
pub use error::{ClientError, Result};
pub use security::{CipherContext, Curve, KeyStrength};
pub use sequence::SequenceGenerator;
