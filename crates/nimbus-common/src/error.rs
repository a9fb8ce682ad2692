//! Error types for NimbusDB.

use crate::types::{BlockId, VersionId};
use thiserror::Error;

/// Result type alias using NimbusError.
pub type Result<T> = std::result::Result<T, NimbusError>;

/// Errors that can occur in NimbusDB operations.
///
/// Programmer contract violations (double commit, re-enqueueing a linked
/// message, releasing a handle twice) are not represented here; they are
/// fatal assertions.
#[derive(Debug, Error)]
pub enum NimbusError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serializer errors
    #[error("Serializer error: {0}")]
    Serializer(String),

    #[error("Block not found: {block_id}")]
    BlockNotFound { block_id: BlockId },

    #[error("Block corrupted: {block_id}, reason: {reason}")]
    BlockCorrupted { block_id: BlockId, reason: String },

    #[error("Block size mismatch: expected {expected}, got {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },

    // Patch log errors
    #[error("Patch record corrupted: {reason}")]
    PatchCorrupted { reason: String },

    #[error("Patch out of bounds on {block_id}: offset {offset} + len {len} > block size {block_size}")]
    PatchOutOfBounds {
        block_id: BlockId,
        offset: usize,
        len: usize,
        block_size: usize,
    },

    // Cache errors
    #[error("No data visible for {block_id} at snapshot version {version}")]
    SnapshotVersionUnavailable { block_id: BlockId, version: VersionId },

    #[error("Write-back failed for {block_id} after {attempts} attempts: {reason}")]
    WriteBackFailed {
        block_id: BlockId,
        attempts: u32,
        reason: String,
    },

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
