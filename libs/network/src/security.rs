//! Key Exchange and Frame Cipher
//!
//! Upgrades a connection to encrypted framing:
//!
//! 1. Generate an ephemeral key pair on the negotiated curve
//! 2. ECDH with the server's PEM public key gives the shared secret
//! 3. IV = MD5(secret); key = first 16 bytes (AES-128) or the 32-byte
//!    secret itself / SHA-256(secret) (AES-256)
//! 4. Send `*key` in plaintext carrying our public point so the server can
//!    derive the same material
//!
//! Every later frame is encrypted whole with AES-CFB. The keystream restarts
//! from the negotiated IV for every frame.

use crate::error::{ClientError, Result};
use aes::{Aes128, Aes256};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use elliptic_curve::ecdh::EphemeralSecret;
use elliptic_curve::pkcs8::{AssociatedOid, DecodePublicKey};
use elliptic_curve::sec1::{FromEncodedPoint, ModulusSize, ToEncodedPoint};
use elliptic_curve::{AffinePoint, CurveArithmetic, FieldBytesSize, PublicKey};
use md5::Md5;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// IV length for AES-CFB
pub const IV_SIZE: usize = 16;

/// Elliptic curve used for the key exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    #[default]
    Secp256k1,
    Secp256r1,
    Secp192r1,
    Secp224r1,
}

impl Curve {
    pub fn name(self) -> &'static str {
        match self {
            Curve::Secp256k1 => "secp256k1",
            Curve::Secp256r1 => "secp256r1",
            Curve::Secp192r1 => "secp192r1",
            Curve::Secp224r1 => "secp224r1",
        }
    }

    /// Resolve a curve name, falling back to secp256k1 for anything unknown
    pub fn from_name_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(curve = name, "Unsupported curve, falling back to secp256k1");
            Curve::Secp256k1
        })
    }
}

impl FromStr for Curve {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "secp256k1" => Ok(Curve::Secp256k1),
            "secp256r1" => Ok(Curve::Secp256r1),
            "secp192r1" => Ok(Curve::Secp192r1),
            "secp224r1" => Ok(Curve::Secp224r1),
            other => Err(ClientError::configuration(
                format!("unsupported curve '{other}'"),
                Some("encryption.curve"),
            )),
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Symmetric key strength; serialized as its bit count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum KeyStrength {
    #[default]
    Aes128,
    Aes256,
}

impl KeyStrength {
    pub fn bits(self) -> u16 {
        match self {
            KeyStrength::Aes128 => 128,
            KeyStrength::Aes256 => 256,
        }
    }

    /// Key length in bytes
    pub fn key_len(self) -> usize {
        self.bits() as usize / 8
    }

    /// Resolve a bit count, falling back to 128 for anything but 256
    pub fn from_bits_or_default(bits: u16) -> Self {
        Self::try_from(bits).unwrap_or_else(|_| {
            warn!(bits, "Unsupported key strength, falling back to 128 bits");
            KeyStrength::Aes128
        })
    }
}

impl TryFrom<u16> for KeyStrength {
    type Error = ClientError;

    fn try_from(bits: u16) -> Result<Self> {
        match bits {
            128 => Ok(KeyStrength::Aes128),
            256 => Ok(KeyStrength::Aes256),
            other => Err(ClientError::configuration(
                format!("key strength must be 128 or 256, got {other}"),
                Some("encryption.strength"),
            )),
        }
    }
}

impl From<KeyStrength> for u16 {
    fn from(strength: KeyStrength) -> Self {
        strength.bits()
    }
}

/// Derive the symmetric key from an ECDH shared secret
pub fn derive_key(secret: &[u8], strength: KeyStrength) -> Result<Vec<u8>> {
    match strength {
        KeyStrength::Aes128 => secret
            .get(..16)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                ClientError::cipher(format!("shared secret too short: {} bytes", secret.len()))
            }),
        KeyStrength::Aes256 if secret.len() == 32 => Ok(secret.to_vec()),
        KeyStrength::Aes256 => Ok(Sha256::digest(secret).to_vec()),
    }
}

/// Derive the IV from an ECDH shared secret
pub fn derive_iv(secret: &[u8]) -> [u8; IV_SIZE] {
    let digest = Md5::digest(secret);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&digest);
    iv
}

/// Negotiated key material for one connection; immutable once built
#[derive(Clone, PartialEq, Eq)]
pub struct CipherContext {
    strength: KeyStrength,
    key: Vec<u8>,
    iv: [u8; IV_SIZE],
}

impl CipherContext {
    /// Build from an explicit key; its length selects AES-128 or AES-256
    pub fn new(key: Vec<u8>, iv: [u8; IV_SIZE]) -> Result<Self> {
        let strength = match key.len() {
            16 => KeyStrength::Aes128,
            32 => KeyStrength::Aes256,
            other => {
                return Err(ClientError::cipher(format!(
                    "key must be 16 or 32 bytes, got {other}"
                )))
            }
        };
        Ok(Self { strength, key, iv })
    }

    pub fn from_shared_secret(secret: &[u8], strength: KeyStrength) -> Result<Self> {
        Self::new(derive_key(secret, strength)?, derive_iv(secret))
    }

    pub fn strength(&self) -> KeyStrength {
        self.strength
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = plaintext.to_vec();
        match self.strength {
            KeyStrength::Aes128 => Encryptor::<Aes128>::new_from_slices(&self.key, &self.iv)
                .map_err(|_| self.key_error())?
                .encrypt(&mut buf),
            KeyStrength::Aes256 => Encryptor::<Aes256>::new_from_slices(&self.key, &self.iv)
                .map_err(|_| self.key_error())?
                .encrypt(&mut buf),
        }
        Ok(buf)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = ciphertext.to_vec();
        match self.strength {
            KeyStrength::Aes128 => Decryptor::<Aes128>::new_from_slices(&self.key, &self.iv)
                .map_err(|_| self.key_error())?
                .decrypt(&mut buf),
            KeyStrength::Aes256 => Decryptor::<Aes256>::new_from_slices(&self.key, &self.iv)
                .map_err(|_| self.key_error())?
                .decrypt(&mut buf),
        }
        Ok(buf)
    }

    fn key_error(&self) -> ClientError {
        ClientError::cipher(format!(
            "invalid key/IV length for AES-{}: key {} bytes",
            self.strength.bits(),
            self.key.len()
        ))
    }
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherContext")
            .field("strength", &self.strength)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Our half of the exchange, sent to the server as the `*key` quest
#[derive(Debug, Clone)]
pub struct KeyExchange {
    pub curve: Curve,
    pub strength: KeyStrength,
    /// Uncompressed public point without the leading 0x04 tag
    pub public_key: Vec<u8>,
}

#[derive(Serialize)]
struct KeyQuestArgs<'a> {
    #[serde(rename = "publicKey", with = "serde_bytes")]
    public_key: &'a [u8],
    #[serde(rename = "streamMode")]
    stream_mode: bool,
    bits: u16,
}

impl KeyExchange {
    /// MessagePack payload of the `*key` quest
    pub fn quest_payload(&self) -> Result<Vec<u8>> {
        let args = KeyQuestArgs {
            public_key: &self.public_key,
            stream_mode: false,
            bits: self.strength.bits(),
        };
        rmp_serde::to_vec_named(&args)
            .map_err(|e| ClientError::payload_with_source("failed to encode *key arguments", e))
    }
}

/// Run the client side of the key exchange against the server's public key
pub fn negotiate(
    peer_public_key_pem: &str,
    curve: Curve,
    strength: KeyStrength,
) -> Result<(CipherContext, KeyExchange)> {
    let (public_key, secret) = match curve {
        Curve::Secp256k1 => agree::<k256::Secp256k1>(peer_public_key_pem)?,
        Curve::Secp256r1 => agree::<p256::NistP256>(peer_public_key_pem)?,
        Curve::Secp192r1 => agree::<p192::NistP192>(peer_public_key_pem)?,
        Curve::Secp224r1 => agree::<p224::NistP224>(peer_public_key_pem)?,
    };

    let cipher = CipherContext::from_shared_secret(&secret, strength)?;
    debug!(
        curve = %curve,
        bits = strength.bits(),
        secret_len = secret.len(),
        "Derived frame cipher from ECDH shared secret"
    );

    Ok((
        cipher,
        KeyExchange {
            curve,
            strength,
            public_key,
        },
    ))
}

/// Ephemeral ECDH on curve `C`; returns our public point and the raw shared secret
fn agree<C>(peer_public_key_pem: &str) -> Result<(Vec<u8>, Vec<u8>)>
where
    C: CurveArithmetic + AssociatedOid,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
    FieldBytesSize<C>: ModulusSize,
{
    let peer = PublicKey::<C>::from_public_key_pem(peer_public_key_pem)
        .map_err(|e| ClientError::cipher_with_source("invalid server public key", e))?;

    let ephemeral = EphemeralSecret::<C>::random(&mut OsRng);
    let shared = ephemeral.diffie_hellman(&peer);

    let point = ephemeral.public_key().to_encoded_point(false);
    let public_key = point.as_bytes()[1..].to_vec();

    Ok((public_key, shared.raw_secret_bytes().to_vec()))
}
