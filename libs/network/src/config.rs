//! Client configuration
//!
//! Loaded from an optional TOML file layered with `FPNN_` environment
//! variables (`FPNN_PORT=13099`, `FPNN_ENCRYPTION__CURVE=secp256r1`).
//! Durations are written as seconds and may be fractional.
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 13099
//! quest_timeout = 5
//! sweep_interval = 1
//!
//! [encryption]
//! peer_public_key_path = "server-public.pem"
//! curve = "secp256r1"
//! strength = 256
//! ```

use crate::error::{ClientError, Result};
use crate::security::{Curve, KeyStrength};
use codec::{HEADER_SIZE, SEQUENCE_SIZE};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Connection and dispatch settings for one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// TCP connect timeout; zero waits for the OS
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Default per-quest timeout; zero means quests never expire
    #[serde(with = "duration_secs")]
    pub quest_timeout: Duration,
    /// How often expired quests are swept
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Largest inbound frame accepted before the connection is dropped
    pub max_frame_size: usize,
    pub tcp_nodelay: bool,
    /// Reconnect immediately after the socket is lost instead of on next send
    pub auto_reconnect: bool,
    pub encryption: Option<EncryptionConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 13099,
            connect_timeout: Duration::from_secs(5),
            quest_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            max_frame_size: 16 * 1024 * 1024, // 16MB
            tcp_nodelay: true,
            auto_reconnect: true,
            encryption: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_quest_timeout(mut self, timeout: Duration) -> Self {
        self.quest_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading client configuration");
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("FPNN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ClientConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ClientError::configuration("host must not be empty", Some("host")));
        }
        if self.port == 0 {
            return Err(ClientError::configuration("port must be non-zero", Some("port")));
        }
        if self.sweep_interval.is_zero() {
            return Err(ClientError::configuration(
                "sweep interval must be positive",
                Some("sweep_interval"),
            ));
        }
        if self.max_frame_size < HEADER_SIZE + SEQUENCE_SIZE {
            return Err(ClientError::configuration(
                format!(
                    "max frame size {} is smaller than an empty answer",
                    self.max_frame_size
                ),
                Some("max_frame_size"),
            ));
        }
        if let Some(encryption) = &self.encryption {
            encryption.validate()?;
        }
        Ok(())
    }

    /// `host:port` suitable for `TcpStream::connect`
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Key exchange settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Server public key in PEM form
    #[serde(default)]
    pub peer_public_key_pem: Option<String>,
    /// Path to a PEM file holding the server public key
    #[serde(default)]
    pub peer_public_key_path: Option<PathBuf>,
    #[serde(default)]
    pub curve: Curve,
    #[serde(default)]
    pub strength: KeyStrength,
}

impl EncryptionConfig {
    pub fn from_pem(pem: impl Into<String>, curve: Curve, strength: KeyStrength) -> Self {
        Self {
            peer_public_key_pem: Some(pem.into()),
            peer_public_key_path: None,
            curve,
            strength,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_public_key_pem.is_none() && self.peer_public_key_path.is_none() {
            return Err(ClientError::configuration(
                "encryption requires peer_public_key_pem or peer_public_key_path",
                Some("encryption"),
            ));
        }
        Ok(())
    }

    /// Server public key PEM, reading the file if only a path is set
    pub fn peer_public_key(&self) -> Result<String> {
        if let Some(pem) = &self.peer_public_key_pem {
            return Ok(pem.clone());
        }
        match &self.peer_public_key_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                ClientError::io(format!("failed to read public key {}", path.display()), e)
            }),
            None => Err(ClientError::configuration(
                "no server public key configured",
                Some("encryption"),
            )),
        }
    }
}

/// Durations as (fractional) seconds
mod duration_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}
