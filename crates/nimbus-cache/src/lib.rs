//! Mirrored buffer cache for NimbusDB.
//!
//! This crate coordinates page lookup, replacement, write-back and
//! multi-version snapshots over a block serializer:
//! - Page map and free list for resident-block bookkeeping
//! - Randomized sampling replacement that never touches referenced or
//!   dirty blocks
//! - An append-only patch log (memory plus serializer-backed mirror) for
//!   small in-place block edits
//! - Batched write-back with bounded retries and commit completion
//! - Copy-on-write snapshots giving read transactions a stable
//!   point-in-time view
//!
//! A cache lives on one home worker; every operation is owner-only and
//! deferred completions run exactly once on that worker.

mod buf;
mod cache;
mod free_list;
mod page_map;
mod page_repl;
mod patch_disk;
mod patch_store;
mod rwi_lock;
mod transaction;
mod writeback;

pub use buf::{AccessMode, BufHandle};
pub use cache::{AcquireCallback, Cache, CacheStats};
pub use rwi_lock::{LockAcquire, LockMode, RwiLock, Ticket};
pub use transaction::{CommitCallback, TxnId};
pub use writeback::FlushReport;
