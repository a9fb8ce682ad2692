//! Core identifier types for the NimbusDB runtime and cache.

use serde::{Deserialize, Serialize};

/// Identifier of one worker thread.
///
/// Worker ids are dense integers in `[0, worker_count)`; each worker owns
/// one OS thread, one event loop, and one message hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker:{}", self.0)
    }
}

/// 64-bit identifier of one serialized block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    /// The serializer's super block.
    pub const SUPERBLOCK: BlockId = BlockId(0);

    /// First block of the range reserved for patch-disk storage.
    pub const FIRST_PATCH_BLOCK: BlockId = BlockId(Self::SUPERBLOCK.0 + 1);

    /// Returns the block id immediately after this one.
    pub fn next(&self) -> BlockId {
        BlockId(self.0 + 1)
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block:{}", self.0)
    }
}

/// Monotonic cache version identifying a point-in-time view.
///
/// Version 0 is the faux version: it sorts below every valid version and
/// is never assigned to a snapshot or a written block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId(pub u64);

impl VersionId {
    /// Faux version below all valid version ids.
    pub const NULL: VersionId = VersionId(0);

    /// First valid version id.
    pub const FIRST: VersionId = VersionId(1);

    /// Returns true if this is a valid (non-faux) version.
    pub fn is_valid(&self) -> bool {
        *self != Self::NULL
    }

    /// Returns the version immediately after this one.
    pub fn next(&self) -> VersionId {
        VersionId(self.0 + 1)
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Monotonic serializer transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SerTxnId(pub u64);

impl SerTxnId {
    /// Id used before a block has ever been written.
    pub const NULL: SerTxnId = SerTxnId(0);
}

/// Message priority level.
///
/// Higher values are scheduled more aggressively; the distinguished
/// ordered priority is configured per runtime.
pub type Priority = i8;

/// Per-block counter ordering the patches applied to one block.
pub type PatchCounter = u32;
