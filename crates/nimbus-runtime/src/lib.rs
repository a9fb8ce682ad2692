//! Worker runtime for NimbusDB.
//!
//! This crate provides:
//! - A one-shot coalescing wake notifier per worker
//! - The per-worker message hub with ordered delivery and a
//!   priority-weighted scheduler
//! - The worker event loop and the pool that binds one hub and one
//!   notifier to each OS thread
//!
//! Cross-worker communication goes exclusively through the hub; all other
//! state lives on its home worker.

mod hub;
mod message;
mod notify;
mod pool;
mod worker;

pub use hub::{HubRegistry, HubStats, MessageHub};
pub use message::{Envelope, ThreadMessage};
pub use notify::WakeNotifier;
pub use pool::WorkerPool;
pub use worker::{current_worker_id, WorkerCx};
