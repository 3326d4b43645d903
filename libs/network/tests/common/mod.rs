//! In-process FPNN responder for integration tests
//!
//! Real loopback TCP, frames built and parsed with the codec crate. Methods:
//!
//! - `echo`: answer with the quest payload
//! - `fail`: answer status 1 with `{code, ex}`
//! - `silent`: never answer
//! - `drop`: close the socket without answering
//! - `*key`: complete the key exchange, answer encrypted
//!
//! Anything else is read and ignored.

#![allow(dead_code)]

use codec::{decode_frame, encode_answer, envelope_len, wrap_envelope, Frame, Header, HEADER_SIZE};
use elliptic_curve::pkcs8::{EncodePublicKey, LineEnding};
use network::{encode_payload, CipherContext, ClientConfig, KeyStrength};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One quest as the responder saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenQuest {
    pub method: String,
    pub sequence: Option<u32>,
    pub encrypted: bool,
}

#[derive(Deserialize)]
struct KeyArgs {
    #[serde(rename = "publicKey", with = "serde_bytes")]
    public_key: Vec<u8>,
    #[serde(rename = "streamMode")]
    stream_mode: bool,
    bits: u16,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: i64,
    ex: &'a str,
}

pub struct Responder {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenQuest>>>,
    connections: Arc<Mutex<usize>>,
    pem: Option<String>,
}

impl Responder {
    /// Plaintext responder on an ephemeral port
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// Responder holding a P-256 key; clients must run the key exchange
    pub async fn start_encrypted() -> Self {
        Self::spawn(Some(Arc::new(p256::SecretKey::random(&mut OsRng)))).await
    }

    async fn spawn(key: Option<Arc<p256::SecretKey>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));
        let pem = key
            .as_ref()
            .map(|k| k.public_key().to_public_key_pem(LineEnding::LF).unwrap());

        let (task_seen, task_connections) = (seen.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                *task_connections.lock().unwrap() += 1;
                tokio::spawn(serve(stream, key.clone(), task_seen.clone()));
            }
        });

        Self {
            addr,
            seen,
            connections,
            pem,
        }
    }

    /// Client settings pointing at this responder with a fast sweep
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.addr.port())
            .with_sweep_interval(Duration::from_millis(20))
            .with_quest_timeout(Duration::from_secs(5))
    }

    pub fn public_key_pem(&self) -> String {
        self.pem.clone().expect("responder was started without a key")
    }

    pub fn seen(&self) -> Vec<SeenQuest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.seen().into_iter().map(|q| q.method).collect()
    }

    pub fn connections(&self) -> usize {
        *self.connections.lock().unwrap()
    }
}

async fn serve(
    mut stream: TcpStream,
    key: Option<Arc<p256::SecretKey>>,
    seen: Arc<Mutex<Vec<SeenQuest>>>,
) {
    let mut cipher: Option<CipherContext> = None;

    loop {
        let frame = match read_quest(&mut stream, cipher.as_ref()).await {
            Some(frame) => frame,
            None => return,
        };
        let method = frame.method.clone().unwrap_or_default();
        seen.lock().unwrap().push(SeenQuest {
            method: method.clone(),
            sequence: frame.sequence,
            encrypted: cipher.is_some(),
        });

        let reply = match method.as_str() {
            "*key" => {
                let server_key = key.as_ref().expect("key exchange against plaintext responder");
                cipher = Some(accept_key_exchange(server_key, &frame.payload));
                Some((0, encode_payload(&()).unwrap()))
            }
            "echo" => Some((0, frame.payload.clone())),
            "fail" => Some((1, encode_payload(&ErrorBody { code: 500, ex: "failure" }).unwrap())),
            "drop" => return,
            _ => None,
        };

        if let (Some((status, payload)), Some(seq)) = (reply, frame.sequence) {
            let answer = encode_answer(seq, status, &payload).unwrap();
            let bytes = match &cipher {
                Some(cipher) => wrap_envelope(&cipher.encrypt(&answer).unwrap()).unwrap(),
                None => answer,
            };
            if stream.write_all(&bytes).await.is_err() {
                return;
            }
        }
    }
}

/// Read one quest; `*key` always arrives in plaintext
async fn read_quest(stream: &mut TcpStream, cipher: Option<&CipherContext>) -> Option<Frame> {
    let plain = match cipher {
        Some(cipher) => {
            let mut prefix = [0u8; 4];
            stream.read_exact(&mut prefix).await.ok()?;
            let mut sealed = vec![0u8; envelope_len(prefix)];
            stream.read_exact(&mut sealed).await.ok()?;
            cipher.decrypt(&sealed).ok()?
        }
        None => {
            let mut head = [0u8; HEADER_SIZE];
            stream.read_exact(&mut head).await.ok()?;
            let header = Header::decode(&head).ok()?;
            let mut buf = vec![0u8; header.frame_len()];
            buf[..HEADER_SIZE].copy_from_slice(&head);
            stream.read_exact(&mut buf[HEADER_SIZE..]).await.ok()?;
            buf
        }
    };
    decode_frame(&plain).ok()
}

fn accept_key_exchange(server_key: &p256::SecretKey, payload: &[u8]) -> CipherContext {
    let args: KeyArgs = rmp_serde::from_slice(payload).unwrap();
    assert!(!args.stream_mode);

    let mut sec1 = vec![0x04];
    sec1.extend_from_slice(&args.public_key);
    let client_key = p256::PublicKey::from_sec1_bytes(&sec1).unwrap();
    let shared = elliptic_curve::ecdh::diffie_hellman(
        server_key.to_nonzero_scalar(),
        client_key.as_affine(),
    );

    let strength = KeyStrength::from_bits_or_default(args.bits);
    CipherContext::from_shared_secret(shared.raw_secret_bytes(), strength).unwrap()
}
