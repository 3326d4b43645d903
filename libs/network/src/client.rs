//! # Client - Quest Dispatch
//!
//! Public request API over one [`Connection`]:
//!
//! - [`Client::send_oneway`]: fire and forget, no waiter
//! - [`Client::send_quest_with_callback`]: callback invoked exactly once
//! - [`Client::send_quest`]: await the answer
//! - [`Client::send_quest_blocking`]: block a plain thread on the answer
//!
//! Every TWOWAY outcome, answer or failure, reaches the caller through the
//! waiter. Argument encoding failures resolve it immediately on the calling
//! task; once a quest is handed to the connection, dropping the calling
//! future no longer affects it.

use crate::answer::{encode_payload, Answer};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, ConnectionStats, HandshakeParams};
use crate::correlation::{CorrelationTable, Waiter};
use crate::error::{ClientError, Result};
use crate::security::{Curve, KeyStrength};
use crate::sequence::SequenceGenerator;
use codec::Quest;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

/// FPNN client; cheap to clone, clones share one connection
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: Arc<Connection>,
    table: Arc<CorrelationTable>,
    sequence: Arc<SequenceGenerator>,
    runtime: Handle,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.connection.abandon();
    }
}

impl Client {
    /// Create a client with its own sequence generator
    ///
    /// Must be called from within a tokio runtime; the connection's
    /// background tasks run on it.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_sequence(config, Arc::new(SequenceGenerator::new()))
    }

    /// Create a client drawing sequence numbers from a shared generator
    pub fn with_sequence(config: ClientConfig, sequence: Arc<SequenceGenerator>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            ClientError::configuration("Client must be created inside a tokio runtime", None)
        })?;

        let handshake = match &config.encryption {
            Some(encryption) => Some(HandshakeParams {
                peer_public_key_pem: encryption.peer_public_key()?,
                curve: encryption.curve,
                strength: encryption.strength,
            }),
            None => None,
        };

        info!(
            endpoint = %config.endpoint(),
            encrypted = handshake.is_some(),
            quest_timeout_ms = config.quest_timeout.as_millis() as u64,
            "Created FPNN client"
        );

        let table = Arc::new(CorrelationTable::new());
        let _guard = runtime.enter();
        let connection = Connection::start(config, table.clone(), sequence.clone(), handshake);

        Ok(Self {
            inner: Arc::new(ClientInner {
                connection,
                table,
                sequence,
                runtime,
            }),
        })
    }

    /// Open the connection now instead of on the first quest
    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await
    }

    /// Run the key exchange against the server's public key
    ///
    /// Every later frame except `*key` is encrypted, and every reconnect
    /// repeats the exchange. Quests in flight on a live socket fail with
    /// `ConnectionBroken` because the socket is replaced.
    pub async fn enable_encryption(
        &self,
        peer_public_key_pem: impl Into<String>,
        curve: Curve,
        strength: KeyStrength,
    ) -> Result<()> {
        let params = HandshakeParams {
            peer_public_key_pem: peer_public_key_pem.into(),
            curve,
            strength,
        };
        self.inner.connection.enable_encryption(params).await
    }

    /// Send a quest without expecting an answer
    pub async fn send_oneway<T: Serialize + ?Sized>(&self, method: &str, args: &T) -> Result<()> {
        let quest = Quest::oneway(method, encode_payload(args)?)?;
        self.inner.connection.send_oneway(quest).await
    }

    /// Send a quest and hand its outcome to `callback`
    ///
    /// The callback runs exactly once: on the receive task, the sweep task,
    /// the task that observed the connection loss or failed the send, or
    /// right here if the arguments could not be encoded.
    pub async fn send_quest_with_callback<T, F>(
        &self,
        method: &str,
        args: &T,
        timeout: Option<Duration>,
        callback: F,
    ) where
        T: Serialize + ?Sized,
        F: FnOnce(Result<Answer>) + Send + 'static,
    {
        let payload = match encode_payload(args) {
            Ok(payload) => payload,
            Err(e) => return callback(Err(e)),
        };

        let sequence = self.inner.sequence.next();
        let timeout = self.effective_timeout(timeout);
        let waiter = Waiter::with_callback(sequence, method, timeout, Box::new(callback));
        self.dispatch(method, payload, waiter).await;
    }

    /// Send a quest and wait for its answer
    ///
    /// A non-zero answer status comes back as `ClientError::Answer`.
    pub async fn send_quest<T: Serialize + ?Sized>(
        &self,
        method: &str,
        args: &T,
        timeout: Option<Duration>,
    ) -> Result<Answer> {
        let payload = encode_payload(args)?;
        let sequence = self.inner.sequence.next();
        let timeout = self.effective_timeout(timeout);
        let (waiter, outcome) = Waiter::with_signal(sequence, method, timeout);

        self.dispatch(method, payload, waiter).await;
        outcome.await.unwrap_or(Err(ClientError::Closed))
    }

    /// Blocking form of [`Client::send_quest`] for threads outside the runtime
    ///
    /// With no effective timeout this blocks until an answer arrives or the
    /// connection fails.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async execution context.
    pub fn send_quest_blocking<T: Serialize + ?Sized>(
        &self,
        method: &str,
        args: &T,
        timeout: Option<Duration>,
    ) -> Result<Answer> {
        let payload = encode_payload(args)?;
        let sequence = self.inner.sequence.next();
        let timeout = self.effective_timeout(timeout);
        let (waiter, outcome) = Waiter::with_signal(sequence, method, timeout);

        let client = self.clone();
        let method = method.to_string();
        self.inner
            .runtime
            .spawn(async move { client.dispatch(&method, payload, waiter).await });

        outcome.blocking_recv().unwrap_or(Err(ClientError::Closed))
    }

    async fn dispatch(&self, method: &str, payload: Vec<u8>, waiter: Waiter) {
        let quest = match Quest::twoway(method, payload, waiter.sequence()) {
            Ok(quest) => quest,
            Err(e) => return waiter.resolve(Err(e.into())),
        };

        if let Err(e) = self.inner.connection.send_twoway(quest, waiter).await {
            warn!(method, error = %e, "Quest dispatch aborted");
        }
    }

    /// Per-call timeout if set and non-zero, else the configured default
    fn effective_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        timeout
            .filter(|t| !t.is_zero())
            .or(Some(self.inner.connection.config().quest_timeout))
            .filter(|t| !t.is_zero())
    }

    /// Close the connection; pending quests fail with `Closed`
    pub async fn close(&self) -> Result<()> {
        self.inner.connection.close().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.connection.is_encrypted()
    }

    /// Number of TWOWAY quests awaiting resolution
    pub fn pending_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.connection.stats()
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.connection.config()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.inner.connection)
            .finish()
    }
}
