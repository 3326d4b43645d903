//! Sequence number generation for TWOWAY quests
//!
//! Numbers live in `[1, 2^31 - 1]` and wrap back to 1. A generator is an
//! explicit value shared by `Arc`; several clients may share one to keep
//! numbers unique across them.

use codec::MAX_SEQUENCE;
use parking_lot::Mutex;

/// Thread-safe increment-and-wrap counter
#[derive(Debug)]
pub struct SequenceGenerator {
    current: Mutex<u32>,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Generator whose next issued number follows `current`
    pub fn starting_after(current: u32) -> Self {
        Self {
            current: Mutex::new(current),
        }
    }

    /// Issue the next sequence number; never returns 0
    pub fn next(&self) -> u32 {
        let mut current = self.current.lock();
        *current = if *current >= MAX_SEQUENCE { 1 } else { *current + 1 };
        *current
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
