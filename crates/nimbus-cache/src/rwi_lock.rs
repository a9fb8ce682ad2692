//! Cooperative reader/writer/intent lock.
//!
//! Buffers live on their home worker, so this lock never blocks a thread:
//! an incompatible acquire queues a ticket, and `release` reports which
//! tickets become holders so the cache can complete the waiting acquires.
//! Waiters are granted strictly FIFO; a compatible acquire still queues
//! behind existing waiters so writers cannot starve.

use std::collections::VecDeque;

/// Lock modes in increasing exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared with other readers and one intent holder.
    Read,
    /// Shared with readers, exclusive against other intents and writers.
    Intent,
    /// Exclusive.
    Write,
}

/// Identifies one queued acquire on one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(pub u64);

/// Outcome of an acquire attempt.
#[derive(Debug)]
pub enum LockAcquire {
    /// The lock is held; proceed.
    Granted,
    /// Queued; the ticket is granted by some later `release`.
    Queued(Ticket),
}

/// Lock state for one buffer.
#[derive(Debug, Default)]
pub struct RwiLock {
    readers: usize,
    intent_held: bool,
    writer_held: bool,
    waiters: VecDeque<(LockMode, Ticket)>,
    next_ticket: u64,
}

impl RwiLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.writer_held,
            LockMode::Intent => !self.writer_held && !self.intent_held,
            LockMode::Write => !self.writer_held && !self.intent_held && self.readers == 0,
        }
    }

    fn grant(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Intent => self.intent_held = true,
            LockMode::Write => self.writer_held = true,
        }
    }

    /// Attempts to take the lock in `mode`.
    pub fn acquire(&mut self, mode: LockMode) -> LockAcquire {
        if self.waiters.is_empty() && self.compatible(mode) {
            self.grant(mode);
            return LockAcquire::Granted;
        }
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.waiters.push_back((mode, ticket));
        LockAcquire::Queued(ticket)
    }

    /// Releases a held `mode` and grants as many queued waiters as the new
    /// state admits, in FIFO order.
    ///
    /// The returned tickets are now holders; the caller must complete
    /// their acquires.
    pub fn release(&mut self, mode: LockMode) -> Vec<(Ticket, LockMode)> {
        match mode {
            LockMode::Read => {
                assert!(self.readers > 0, "read release without a reader");
                self.readers -= 1;
            }
            LockMode::Intent => {
                assert!(self.intent_held, "intent release without an intent holder");
                self.intent_held = false;
            }
            LockMode::Write => {
                assert!(self.writer_held, "write release without a writer");
                self.writer_held = false;
            }
        }
        self.pump()
    }

    fn pump(&mut self) -> Vec<(Ticket, LockMode)> {
        let mut granted = Vec::new();
        while let Some(&(mode, ticket)) = self.waiters.front() {
            if !self.compatible(mode) {
                break;
            }
            self.waiters.pop_front();
            self.grant(mode);
            granted.push((ticket, mode));
        }
        granted
    }

    /// True when nothing holds or waits on the lock.
    pub fn is_unlocked(&self) -> bool {
        self.readers == 0 && !self.intent_held && !self.writer_held && self.waiters.is_empty()
    }

    /// Number of queued waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}
