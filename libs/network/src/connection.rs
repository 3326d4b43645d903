//! # Connection - Socket Ownership, Receive Task, Sweep Task, Reconnect
//!
//! ## Purpose
//!
//! Owns the TCP socket to one FPNN server and everything tied to its
//! lifetime: the write half, the optional frame cipher, and the receive task
//! reading answers off the read half. A sweep task runs for the whole life of
//! the connection and fails quests whose deadline has passed.
//!
//! ## Locking
//!
//! ```text
//! link: tokio Mutex<Option<Link>>   write exclusion + socket replacement
//! table: parking_lot Mutex          waiter registration and claiming
//! state: parking_lot Mutex          ConnectionState
//! ```
//!
//! Sends, reconnects, link loss handling and close all run under the `link`
//! lock, so no send observes a half-replaced socket and a waiter registered
//! on a new socket is never drained by the loss of an old one. Waiters are
//! registered under the `link` lock before their quest is written, so an
//! answer can never arrive ahead of its waiter. Each send runs on its own
//! task; a caller that stops waiting never leaves a partial frame behind.
//!
//! ## Shutdown
//!
//! `close()` raises the stop flag, shuts the socket down, awaits the receive
//! and sweep tasks, then fails whatever is still pending with `Closed`.

use crate::answer::Answer;
use crate::config::ClientConfig;
use crate::correlation::{CorrelationTable, Waiter};
use crate::error::{ClientError, Result};
use crate::security::{self, CipherContext, Curve, KeyStrength};
use crate::sequence::SequenceGenerator;
use codec::{
    decode_frame, envelope_len, wrap_envelope, Frame, Header, ProtocolError, Quest,
    ENVELOPE_PREFIX_SIZE, HEADER_SIZE, KEY_EXCHANGE_METHOD,
};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Closing or closed; no further connects are attempted
    pub fn is_shutting_down(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// Parameters retained so every new socket repeats the key exchange
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub peer_public_key_pem: String,
    pub curve: Curve,
    pub strength: KeyStrength,
}

/// Snapshot of connection counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnects: u64,
    pub unmatched_answers: u64,
}

#[derive(Debug, Default)]
struct StatsTracker {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    reconnects: AtomicU64,
    unmatched_answers: AtomicU64,
}

impl StatsTracker {
    fn record_send(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_receive(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            unmatched_answers: self.unmatched_answers.load(Ordering::Relaxed),
        }
    }
}

/// One live socket: write half, cipher and the task reading its other half
struct Link {
    writer: OwnedWriteHalf,
    cipher: Option<Arc<CipherContext>>,
    peer_addr: SocketAddr,
    generation: u64,
    receiver: JoinHandle<()>,
}

/// A twoway send that did not make it onto the wire
///
/// Carries the waiter back when it was not (or no longer) registered, so the
/// caller can resolve it. `waiter` is `None` when another path already
/// claimed it.
#[derive(Debug)]
struct SendFailure {
    error: ClientError,
    waiter: Option<Waiter>,
}

impl SendFailure {
    /// Deliver the error to the waiter if this failure still owns it
    fn resolve(self) {
        if let Some(waiter) = self.waiter {
            waiter.resolve(Err(self.error));
        }
    }
}

type ReceiveTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Connection to a single FPNN server
pub struct Connection {
    config: ClientConfig,
    table: Arc<CorrelationTable>,
    sequence: Arc<SequenceGenerator>,
    link: tokio::sync::Mutex<Option<Link>>,
    state: Mutex<ConnectionState>,
    handshake: Mutex<Option<HandshakeParams>>,
    generation: AtomicU64,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stats: StatsTracker,
}

impl Connection {
    /// Create the connection and start its sweep task
    ///
    /// Must be called from within a tokio runtime. No socket is opened until
    /// [`Connection::connect`] or the first send.
    pub fn start(
        config: ClientConfig,
        table: Arc<CorrelationTable>,
        sequence: Arc<SequenceGenerator>,
        handshake: Option<HandshakeParams>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let connection = Arc::new(Self {
            config,
            table,
            sequence,
            link: tokio::sync::Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            handshake: Mutex::new(handshake),
            generation: AtomicU64::new(0),
            shutdown,
            sweeper: Mutex::new(None),
            stats: StatsTracker::default(),
        });

        let sweeper = tokio::spawn(Self::sweep_loop(
            Arc::downgrade(&connection),
            connection.shutdown.subscribe(),
        ));
        *connection.sweeper.lock() = Some(sweeper);
        connection
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether frames after the key exchange are encrypted
    pub fn is_encrypted(&self) -> bool {
        self.handshake.lock().is_some()
    }

    /// Move to `next` unless shutdown already began; only `Closed` follows `Closing`
    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if state.is_shutting_down() && next != ConnectionState::Closed {
            return;
        }
        *state = next;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().is_shutting_down() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Open the socket now instead of on the first send
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.link.lock().await;
        self.connect_locked(&mut slot).await
    }

    /// Switch to encrypted framing; a live socket is replaced so the key
    /// exchange is the first frame on the new one
    ///
    /// A server key that cannot be agreed with is rejected before the
    /// current link or handshake settings are touched.
    pub async fn enable_encryption(self: &Arc<Self>, params: HandshakeParams) -> Result<()> {
        self.ensure_open()?;
        security::negotiate(&params.peer_public_key_pem, params.curve, params.strength)?;

        let mut slot = self.link.lock().await;
        *self.handshake.lock() = Some(params);

        if let Some(link) = slot.take() {
            info!(peer = %link.peer_addr, "Re-establishing connection for key exchange");
            self.retire(link, "connection re-keyed").await;
        }
        self.connect_locked(&mut slot).await
    }

    async fn connect_locked(self: &Arc<Self>, slot: &mut Option<Link>) -> Result<()> {
        self.ensure_open()?;
        if slot.is_some() {
            return Ok(());
        }

        self.transition(ConnectionState::Connecting);
        match self.establish().await {
            Ok(link) => {
                info!(
                    peer = %link.peer_addr,
                    generation = link.generation,
                    encrypted = link.cipher.is_some(),
                    "Connected to FPNN server"
                );
                if link.generation > 1 {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                }
                *slot = Some(link);
                self.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %self.config.endpoint(), error = %e, "Failed to connect");
                self.transition(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Dial, run the key exchange if configured, and arm a receive task
    async fn establish(self: &Arc<Self>) -> Result<Link> {
        let endpoint = self.config.endpoint();
        debug!(endpoint = %endpoint, "Connecting to FPNN server");

        let connect = TcpStream::connect(&endpoint);
        let stream = if self.config.connect_timeout.is_zero() {
            connect.await
        } else {
            tokio::time::timeout(self.config.connect_timeout, connect)
                .await
                .map_err(|_| {
                    ClientError::connection_broken(
                        format!("connect timed out after {:?}", self.config.connect_timeout),
                        None,
                    )
                })?
        }
        .map_err(|e| ClientError::connection_broken_with_source("failed to connect", None, e))?;

        if self.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        let peer_addr = stream.peer_addr().map_err(|e| {
            ClientError::connection_broken_with_source("failed to get peer address", None, e)
        })?;
        let (reader, mut writer) = stream.into_split();

        let params = self.handshake.lock().clone();
        let cipher = match params {
            Some(params) => {
                let cipher = self.key_exchange(&mut writer, peer_addr, &params).await?;
                Some(Arc::new(cipher))
            }
            None => None,
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let receiver =
            tokio::spawn(self.receive_task(reader, cipher.clone(), generation, peer_addr));

        Ok(Link {
            writer,
            cipher,
            peer_addr,
            generation,
            receiver,
        })
    }

    /// Derive the frame cipher and send `*key` in plaintext
    async fn key_exchange(
        &self,
        writer: &mut OwnedWriteHalf,
        peer_addr: SocketAddr,
        params: &HandshakeParams,
    ) -> Result<CipherContext> {
        let (cipher, exchange) =
            security::negotiate(&params.peer_public_key_pem, params.curve, params.strength)?;

        let payload = exchange.quest_payload()?;
        let quest = Quest::twoway(KEY_EXCHANGE_METHOD, payload, self.sequence.next())?;
        let frame = quest.encode();
        writer.write_all(&frame).await.map_err(|e| {
            ClientError::connection_broken_with_source(
                "failed to send key exchange",
                Some(peer_addr),
                e,
            )
        })?;
        self.stats.record_send(frame.len());

        info!(
            peer = %peer_addr,
            curve = %params.curve,
            bits = params.strength.bits(),
            "Key exchange sent, frames are now encrypted"
        );
        Ok(cipher)
    }

    fn receive_task(
        self: &Arc<Self>,
        reader: OwnedReadHalf,
        cipher: Option<Arc<CipherContext>>,
        generation: u64,
        peer_addr: SocketAddr,
    ) -> ReceiveTask {
        Box::pin(self.clone().receive_loop(reader, cipher, generation, peer_addr))
    }

    /// Send a ONEWAY quest
    ///
    /// The write runs on its own task: dropping the returned future does not
    /// cut a frame short on the socket.
    pub async fn send_oneway(self: &Arc<Self>, quest: Quest) -> Result<()> {
        let connection = self.clone();
        let send = tokio::spawn(async move { connection.transmit_oneway(&quest).await });
        send.await
            .map_err(|e| ClientError::connection_broken(format!("send task failed: {e}"), None))?
    }

    /// Register `waiter` and send its TWOWAY quest
    ///
    /// On success the waiter will be resolved later by an answer, the sweep
    /// task, or a connection failure. Registration and write run on their own
    /// task, so once this future is first polled the waiter is always
    /// resolved and the frame is either written whole or the link is dropped.
    pub async fn send_twoway(self: &Arc<Self>, quest: Quest, waiter: Waiter) -> Result<()> {
        let connection = self.clone();
        let send = tokio::spawn(async move {
            let outcome = connection.transmit_twoway(&quest, waiter).await;
            if let Err(failure) = outcome {
                debug!(
                    seq = quest.sequence(),
                    method = %quest.method(),
                    error = %failure.error,
                    "Quest failed before reaching the server"
                );
                failure.resolve();
            }
        });
        send.await
            .map_err(|e| ClientError::connection_broken(format!("send task failed: {e}"), None))
    }

    async fn transmit_oneway(self: &Arc<Self>, quest: &Quest) -> Result<()> {
        let mut slot = self.link.lock().await;
        self.connect_locked(&mut slot).await?;

        if let Err(e) = self.write_locked(&mut slot, quest).await {
            if e.is_fatal_to_connection() {
                self.drop_link_locked(&mut slot, &e).await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn transmit_twoway(
        self: &Arc<Self>,
        quest: &Quest,
        waiter: Waiter,
    ) -> std::result::Result<(), SendFailure> {
        let mut slot = self.link.lock().await;
        if let Err(error) = self.connect_locked(&mut slot).await {
            return Err(SendFailure {
                error,
                waiter: Some(waiter),
            });
        }

        let sequence = waiter.sequence();
        if let Err(rejected) = self.table.register(waiter) {
            error!(seq = sequence, method = %quest.method(), "Sequence number already in flight");
            return Err(SendFailure {
                error: ClientError::DuplicateKey { sequence },
                waiter: Some(rejected),
            });
        }

        if let Err(error) = self.write_locked(&mut slot, quest).await {
            let waiter = self.table.take(sequence);
            if error.is_fatal_to_connection() {
                self.drop_link_locked(&mut slot, &error).await;
            }
            return Err(SendFailure { error, waiter });
        }
        Ok(())
    }

    async fn write_locked(&self, slot: &mut Option<Link>, quest: &Quest) -> Result<()> {
        let link = slot
            .as_mut()
            .ok_or_else(|| ClientError::connection_broken("not connected", None))?;

        let plain = quest.encode();
        let frame = match &link.cipher {
            Some(cipher) => wrap_envelope(&cipher.encrypt(&plain)?)?,
            None => plain,
        };

        link.writer.write_all(&frame).await.map_err(|e| {
            ClientError::connection_broken_with_source(
                "failed to write frame",
                Some(link.peer_addr),
                e,
            )
        })?;
        self.stats.record_send(frame.len());

        debug!(
            seq = quest.sequence(),
            method = %quest.method(),
            bytes = frame.len(),
            "Sent quest"
        );
        Ok(())
    }

    /// Tear down the current link after a send failure; reconnect happens on the next send
    async fn drop_link_locked(&self, slot: &mut Option<Link>, cause: &ClientError) {
        if let Some(link) = slot.take() {
            warn!(
                peer = %link.peer_addr,
                error = %cause,
                "Dropping connection after write failure"
            );
            self.transition(ConnectionState::Disconnected);
            self.retire(link, "connection lost on write").await;
        }
    }

    /// Stop a link's receive task, close its socket, and fail everything in flight
    async fn retire(&self, mut link: Link, reason: &str) {
        link.receiver.abort();
        let _ = link.writer.shutdown().await;
        self.fail_pending(reason, Some(link.peer_addr));
    }

    fn fail_pending(&self, reason: &str, peer_addr: Option<SocketAddr>) {
        let drained = self.table.drain_all();
        if !drained.is_empty() {
            warn!(count = drained.len(), reason, "Failing quests in flight");
        }
        for waiter in drained {
            waiter.resolve(Err(ClientError::connection_broken(reason, peer_addr)));
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        cipher: Option<Arc<CipherContext>>,
        generation: u64,
        peer_addr: SocketAddr,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        debug!(peer = %peer_addr, generation, "Receive task started");

        loop {
            let frame = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    debug!(peer = %peer_addr, generation, "Receive task stopping");
                    return;
                }
                frame = self.read_frame(&mut reader, cipher.as_deref(), peer_addr) => frame,
            };

            match frame {
                Ok(frame) => self.dispatch(frame),
                Err(e) => {
                    if self.state().is_shutting_down() {
                        return;
                    }
                    warn!(peer = %peer_addr, generation, error = %e, "Receive failed");
                    self.link_lost(generation, e).await;
                    return;
                }
            }
        }
    }

    /// Read exactly one frame, decrypting when the link is encrypted
    async fn read_frame(
        &self,
        reader: &mut OwnedReadHalf,
        cipher: Option<&CipherContext>,
        peer_addr: SocketAddr,
    ) -> Result<Frame> {
        let read_err = |e: std::io::Error| {
            ClientError::connection_broken_with_source("failed to read frame", Some(peer_addr), e)
        };
        let limit = self.config.max_frame_size;

        let (plain, wire_len) = match cipher {
            Some(cipher) => {
                let mut prefix = [0u8; ENVELOPE_PREFIX_SIZE];
                reader.read_exact(&mut prefix).await.map_err(read_err)?;
                let len = envelope_len(prefix);
                if len > limit {
                    return Err(ProtocolError::frame_too_large(len, limit).into());
                }

                let mut sealed = vec![0u8; len];
                reader.read_exact(&mut sealed).await.map_err(read_err)?;
                (cipher.decrypt(&sealed)?, ENVELOPE_PREFIX_SIZE + len)
            }
            None => {
                let mut head = [0u8; HEADER_SIZE];
                reader.read_exact(&mut head).await.map_err(read_err)?;
                let header = Header::decode(&head)?;
                let total = header.frame_len();
                if total > limit {
                    return Err(ProtocolError::frame_too_large(total, limit).into());
                }

                let mut buf = vec![0u8; total];
                buf[..HEADER_SIZE].copy_from_slice(&head);
                reader.read_exact(&mut buf[HEADER_SIZE..]).await.map_err(read_err)?;
                (buf, total)
            }
        };

        self.stats.record_receive(wire_len);
        Ok(decode_frame(&plain)?)
    }

    /// Hand an answer to its waiter; anything unmatched is dropped
    fn dispatch(&self, frame: Frame) {
        let Some(answer) = Answer::from_frame(frame) else {
            warn!("Dropping inbound quest, server-initiated quests are not served");
            return;
        };

        debug!(
            seq = answer.sequence(),
            status = answer.status(),
            bytes = answer.payload().len(),
            "Received answer"
        );

        match self.table.take(answer.sequence()) {
            Some(waiter) => waiter.resolve(answer.into_result()),
            None => {
                self.stats.unmatched_answers.fetch_add(1, Ordering::Relaxed);
                // the *key answer always lands here
                debug!(seq = answer.sequence(), "Dropping unmatched answer");
            }
        }
    }

    /// Socket `generation` failed on read: fail its quests and reconnect
    async fn link_lost(self: &Arc<Self>, generation: u64, cause: ClientError) {
        let mut slot = self.link.lock().await;
        if slot.as_ref().map(|link| link.generation) != Some(generation) {
            return;
        }

        self.transition(ConnectionState::Disconnected);
        if let Some(mut link) = slot.take() {
            self.fail_pending(&format!("connection lost: {cause}"), Some(link.peer_addr));
            let _ = link.writer.shutdown().await;
        }

        if !self.config.auto_reconnect || self.state().is_shutting_down() {
            return;
        }
        match self.connect_locked(&mut slot).await {
            Ok(()) => info!("Reconnected after connection loss"),
            Err(e) => warn!(error = %e, "Reconnect failed, retrying on next send"),
        }
    }

    async fn sweep_loop(connection: std::sync::Weak<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(interval) = connection.upgrade().map(|c| c.config.sweep_interval) else {
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return,
                _ = ticker.tick() => {}
            }

            let Some(connection) = connection.upgrade() else {
                return;
            };
            for waiter in connection.table.sweep_expired(Instant::now()) {
                warn!(seq = waiter.sequence(), method = %waiter.method(), "Quest timed out");
                waiter.time_out();
            }
        }
    }

    /// Stop both tasks, close the socket, and fail every pending quest with `Closed`
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.is_shutting_down() {
                return Ok(());
            }
            *state = ConnectionState::Closing;
        }
        self.shutdown.send_replace(true);

        let link = self.link.lock().await.take();
        if let Some(mut link) = link {
            if let Err(e) = link.writer.shutdown().await {
                warn!("Error shutting down FPNN connection: {}", e);
            }
            let _ = link.receiver.await;
            info!(peer = %link.peer_addr, "Closed FPNN connection");
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        for waiter in self.table.drain_all() {
            waiter.resolve(Err(ClientError::Closed));
        }
        self.transition(ConnectionState::Closed);
        Ok(())
    }

    /// Synchronous shutdown for drop paths: stop tasks and fail pending quests
    pub fn abandon(&self) {
        {
            let mut state = self.state.lock();
            if state.is_shutting_down() {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.shutdown.send_replace(true);
        for waiter in self.table.drain_all() {
            waiter.resolve(Err(ClientError::Closed));
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.config.endpoint())
            .field("state", &self.state())
            .field("pending", &self.table.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, ClientConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ClientConfig::new("127.0.0.1", port)
            .with_sweep_interval(Duration::from_millis(20));
        (listener, config)
    }

    fn connection(config: ClientConfig) -> Arc<Connection> {
        Connection::start(
            config,
            Arc::new(CorrelationTable::new()),
            Arc::new(SequenceGenerator::new()),
            None,
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_state_transitions() {
        let (listener, config) = listener().await;
        let conn = connection(config);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.connect().await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        assert!(conn.is_connected());

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.connect().await, Err(ClientError::Closed)));
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_refused_stays_disconnected() {
        let (listener, config) = listener().await;
        drop(listener);

        let conn = connection(config);
        let err = conn.connect().await.unwrap_err();
        assert!(err.is_connection_broken());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test_log::test(tokio::test)]
    async fn test_oversized_frame_drops_link() {
        let (listener, config) = listener().await;
        let conn = connection(config.with_max_frame_size(64).with_auto_reconnect(false));
        conn.connect().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let (waiter, rx) = Waiter::with_signal(1, "big", None);
        conn.table.register(waiter).unwrap();

        let frame = codec::encode_answer(1, 0, &[0u8; 128]).unwrap();
        server.write_all(&frame).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(ClientError::ConnectionBroken { .. })));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test_log::test(tokio::test)]
    async fn test_sweep_task_stops_on_drop() {
        let (_listener, config) = listener().await;
        let conn = connection(config);
        let sweeper = conn.sweeper.lock().take().unwrap();

        drop(conn);
        tokio::time::timeout(Duration::from_secs(5), sweeper).await.unwrap().unwrap();
    }

    async fn read_quest(server: &mut TcpStream) -> Frame {
        let mut head = [0u8; HEADER_SIZE];
        server.read_exact(&mut head).await.unwrap();
        let header = Header::decode(&head).unwrap();

        let mut buf = vec![0u8; header.frame_len()];
        buf[..HEADER_SIZE].copy_from_slice(&head);
        server.read_exact(&mut buf[HEADER_SIZE..]).await.unwrap();
        decode_frame(&buf).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_dropped_send_still_writes_whole_frame() {
        let (listener, config) = listener().await;
        let conn = connection(config);
        conn.connect().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        // the server is not reading yet, so this stalls once the socket buffers fill
        let big = Quest::oneway("big", vec![0xAB; 32 * 1024 * 1024]).unwrap();
        let dropped = tokio::time::timeout(Duration::from_millis(100), conn.send_oneway(big)).await;
        assert!(dropped.is_err());

        let server_task = tokio::spawn(async move {
            let first = read_quest(&mut server).await;
            let second = read_quest(&mut server).await;
            let sequence = second.sequence.unwrap();
            let answer = codec::encode_answer(sequence, 0, b"ok").unwrap();
            server.write_all(&answer).await.unwrap();
            (first, second, server)
        });

        let (waiter, rx) = Waiter::with_signal(7, "next", None);
        let quest = Quest::twoway("next", Vec::new(), 7).unwrap();
        conn.send_twoway(quest, waiter).await.unwrap();

        let answer = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&answer.payload()[..], b"ok");

        let (first, second, _server) = server_task.await.unwrap();
        assert_eq!(first.method.as_deref(), Some("big"));
        assert_eq!(first.payload.len(), 32 * 1024 * 1024);
        assert_eq!(second.method.as_deref(), Some("next"));
        assert_eq!(second.sequence, Some(7));
    }

    #[test_log::test(tokio::test)]
    async fn test_duplicate_sequence_keeps_first_waiter() {
        let (listener, config) = listener().await;
        let conn = connection(config);
        conn.connect().await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let (first, _first_rx) = Waiter::with_signal(9, "first", None);
        conn.table.register(first).unwrap();

        let (second, second_rx) = Waiter::with_signal(9, "second", None);
        let quest = Quest::twoway("second", Vec::new(), 9).unwrap();
        conn.send_twoway(quest, second).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), second_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(ClientError::DuplicateKey { sequence: 9 })));

        assert_eq!(conn.table.len(), 1);
        assert_eq!(conn.table.take(9).unwrap().method(), "first");
        assert_eq!(conn.stats().frames_sent, 0);
    }
}
