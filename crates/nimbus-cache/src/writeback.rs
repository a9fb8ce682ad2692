//! Write-back bookkeeping.
//!
//! The flush algorithm itself lives on the cache, which owns every
//! component a cycle touches; this module tracks the dirty set, the
//! transactions waiting on a sync, and the cycle cadence.

use crate::page_map::BufSlot;
use crate::transaction::TxnId;
use std::time::{Duration, Instant};

/// Counters for one flush cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushReport {
    /// Blocks written in full.
    pub full_writes: usize,
    /// Blocks written as accumulated patches.
    pub patch_writes: usize,
    /// Blocks deleted.
    pub deletes: usize,
    /// Serializer writes that failed this cycle.
    pub write_failures: usize,
    /// Blocks still dirty after the cycle (failed or deferred).
    pub retained_dirty: usize,
}

impl FlushReport {
    /// True when every captured block was persisted.
    pub fn is_clean(&self) -> bool {
        self.retained_dirty == 0
    }
}

pub(crate) struct WriteBack {
    dirty_slots: Vec<BufSlot>,
    sync_waiters: Vec<TxnId>,
    pub flush_in_progress: bool,
    last_flush: Option<Instant>,
}

impl WriteBack {
    pub fn new() -> Self {
        Self {
            dirty_slots: Vec::new(),
            sync_waiters: Vec::new(),
            flush_in_progress: false,
            last_flush: None,
        }
    }

    /// Adds a newly dirty buffer to the flush set.
    ///
    /// The caller transitions the buffer's dirty flag, which is what keeps
    /// this list duplicate-free.
    pub fn enlist(&mut self, slot: BufSlot) {
        self.dirty_slots.push(slot);
    }

    /// Captures the dirty set for one cycle.
    pub fn take_dirty(&mut self) -> Vec<BufSlot> {
        std::mem::take(&mut self.dirty_slots)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_slots.len()
    }

    /// Registers a committing transaction to be completed on sync.
    pub fn add_sync_waiter(&mut self, txn: TxnId) {
        self.sync_waiters.push(txn);
    }

    pub fn take_sync_waiters(&mut self) -> Vec<TxnId> {
        std::mem::take(&mut self.sync_waiters)
    }

    pub fn has_sync_waiters(&self) -> bool {
        !self.sync_waiters.is_empty()
    }

    /// Whether a time- or size-triggered cycle is due.
    pub fn should_flush(
        &self,
        now: Instant,
        interval: Duration,
        dirty_threshold: usize,
    ) -> bool {
        if self.dirty_count() == 0 && !self.has_sync_waiters() {
            return false;
        }
        if self.dirty_count() >= dirty_threshold {
            return true;
        }
        match self.last_flush {
            Some(last) => now.duration_since(last) >= interval,
            None => true,
        }
    }

    pub fn note_flushed(&mut self, now: Instant) {
        self.last_flush = Some(now);
    }
}
