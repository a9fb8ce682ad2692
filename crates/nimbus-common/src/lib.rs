//! NimbusDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all NimbusDB
//! components: identifier newtypes, the error enum, configuration
//! structures, block patches, and the process-wide logging sink.

pub mod config;
pub mod error;
pub mod logging;
pub mod patch;
pub mod types;

pub use config::{CacheConfig, RuntimeConfig, SchedulerConfig};
pub use error::{NimbusError, Result};
pub use patch::Patch;
pub use types::{BlockId, Priority, SerTxnId, VersionId, WorkerId};
