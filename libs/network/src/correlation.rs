//! # Correlation Table
//!
//! In-flight TWOWAY quests keyed by sequence number. Three activities race to
//! claim a waiter: the receive task (answer arrived), the sweep task
//! (deadline passed) and the connection (socket lost or client closed).
//! Claiming is a remove under the table lock, so whoever removes the entry is
//! the only one that can resolve it. Resolution itself always happens after
//! the lock is released.
//!
//! A [`Waiter`] is consumed by [`Waiter::resolve`], so a second resolution
//! does not type-check.

use crate::answer::Answer;
use crate::error::{ClientError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::error;

/// Callback invoked exactly once with the quest's outcome
pub type AnswerCallback = Box<dyn FnOnce(Result<Answer>) + Send + 'static>;

enum Completion {
    Callback(AnswerCallback),
    Signal(oneshot::Sender<Result<Answer>>),
}

/// Bookkeeping for one in-flight TWOWAY quest
pub struct Waiter {
    sequence: u32,
    method: String,
    registered_at: Instant,
    timeout: Option<Duration>,
    completion: Completion,
}

impl Waiter {
    /// Waiter that hands the outcome to `callback`
    pub fn with_callback(
        sequence: u32,
        method: impl Into<String>,
        timeout: Option<Duration>,
        callback: AnswerCallback,
    ) -> Self {
        Self::build(sequence, method.into(), timeout, Completion::Callback(callback))
    }

    /// Waiter whose outcome is delivered to the returned receiver
    pub fn with_signal(
        sequence: u32,
        method: impl Into<String>,
        timeout: Option<Duration>,
    ) -> (Self, oneshot::Receiver<Result<Answer>>) {
        let (tx, rx) = oneshot::channel();
        (Self::build(sequence, method.into(), timeout, Completion::Signal(tx)), rx)
    }

    fn build(
        sequence: u32,
        method: String,
        timeout: Option<Duration>,
        completion: Completion,
    ) -> Self {
        Self {
            sequence,
            method,
            registered_at: Instant::now(),
            timeout: timeout.filter(|t| !t.is_zero()),
            completion,
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// `None` when the waiter never expires
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.registered_at + t)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Deliver the outcome
    pub fn resolve(self, outcome: Result<Answer>) {
        match self.completion {
            Completion::Callback(callback) => {
                let sequence = self.sequence;
                if catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
                    error!(seq = sequence, method = %self.method, "Answer callback panicked");
                }
            }
            // receiver gone means the caller stopped waiting
            Completion::Signal(tx) => {
                let _ = tx.send(outcome);
            }
        }
    }

    /// Resolve with a timeout failure
    pub fn time_out(self) {
        let timeout_ms = self.timeout.map_or(0, |t| t.as_millis() as u64);
        let err = ClientError::timeout(self.sequence, self.method.clone(), timeout_ms);
        self.resolve(Err(err));
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("sequence", &self.sequence)
            .field("method", &self.method)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Registry of in-flight waiters
#[derive(Debug, Default)]
pub struct CorrelationTable {
    waiters: Mutex<HashMap<u32, Waiter>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a waiter; a sequence already in flight hands the waiter back
    pub fn register(&self, waiter: Waiter) -> std::result::Result<(), Waiter> {
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(&waiter.sequence) {
            return Err(waiter);
        }
        waiters.insert(waiter.sequence, waiter);
        Ok(())
    }

    /// Claim the waiter for `sequence`, `None` if already claimed or unknown
    pub fn take(&self, sequence: u32) -> Option<Waiter> {
        self.waiters.lock().remove(&sequence)
    }

    /// Remove and return every waiter whose deadline is at or before `now`
    pub fn sweep_expired(&self, now: Instant) -> Vec<Waiter> {
        let mut waiters = self.waiters.lock();
        let expired: Vec<u32> = waiters
            .values()
            .filter(|w| w.is_expired(now))
            .map(|w| w.sequence)
            .collect();
        expired.into_iter().filter_map(|seq| waiters.remove(&seq)).collect()
    }

    /// Remove and return every waiter
    pub fn drain_all(&self) -> Vec<Waiter> {
        self.waiters.lock().drain().map(|(_, w)| w).collect()
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.waiters.lock().contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}
