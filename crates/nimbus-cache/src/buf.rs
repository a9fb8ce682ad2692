//! Inner buffers: the canonical resident representation of one block.

use crate::page_map::BufSlot;
use crate::rwi_lock::RwiLock;
use crate::transaction::TxnId;
use nimbus_common::types::PatchCounter;
use nimbus_common::{BlockId, SerTxnId, VersionId};

/// How a buffer handle accesses its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Shared read of current data.
    Read,
    /// Immediate read that tolerates the data being superseded while the
    /// handle is live; never waits on the lock.
    ReadOutdatedOk,
    /// Exclusive write.
    Write,
}

/// One preserved pre-write page image.
///
/// `version` is the version the canonical page had when the image was
/// captured; every active snapshot in `[version, successor)` reads it.
#[derive(Debug)]
pub(crate) struct SnapshotInfo {
    pub version: VersionId,
    pub data: Box<[u8]>,
    /// Owners: registered snapshot transactions plus outdated-ok readers
    /// whose data moved here on copy-on-write.
    pub refs: u32,
}

/// The canonical resident state of one block.
///
/// Sibling components (write-back, replacement, page map) address the
/// buffer by its slot and read the embedded state below; there are no
/// shared sub-objects.
pub(crate) struct InnerBuf {
    pub block_id: BlockId,
    /// Canonical page. Writers mutate this image in place after any
    /// needed snapshot has been captured.
    pub data: Box<[u8]>,
    /// Version of the last write to the canonical page; `NULL` for pages
    /// loaded from disk that predate every snapshot.
    pub version_id: VersionId,
    /// Logical access clock value of the most recent acquire.
    pub subtree_recency: u64,
    pub lock: RwiLock,
    pub next_patch_counter: PatchCounter,
    /// Number of live handles on this buffer.
    pub refcount: u32,
    /// Flagged for deletion at the next flush.
    pub do_delete: bool,
    /// On deletion, write a zero block instead of dropping the block.
    pub write_empty_deleted_block: bool,
    /// Live outdated-ok readers currently pointing at the canonical page;
    /// a write acquisition must preserve the page for them.
    pub cow_refs: u32,
    /// Preserved page images, ascending by version.
    pub snapshots: Vec<SnapshotInfo>,
    /// Serializer transaction of the last completed flush.
    pub ser_txn_id: SerTxnId,

    // Write-back state.
    pub dirty: bool,
    /// Force a full-block write for this flush cycle.
    pub needs_full_flush: bool,
    pub in_flush: bool,
    pub flush_attempts: u32,
}

impl InnerBuf {
    /// Creates a buffer holding `data` at the given version.
    pub fn new(block_id: BlockId, data: Box<[u8]>, version_id: VersionId) -> Self {
        Self {
            block_id,
            data,
            version_id,
            subtree_recency: 0,
            lock: RwiLock::new(),
            next_patch_counter: 0,
            refcount: 0,
            do_delete: false,
            write_empty_deleted_block: true,
            cow_refs: 0,
            snapshots: Vec::new(),
            ser_txn_id: SerTxnId::NULL,
            dirty: false,
            needs_full_flush: false,
            in_flush: false,
            flush_attempts: 0,
        }
    }

    /// Allocates the next patch counter for this block.
    pub fn allocate_patch_counter(&mut self) -> PatchCounter {
        let counter = self.next_patch_counter;
        self.next_patch_counter += 1;
        counter
    }

    /// Resolves the page image visible at `version`.
    ///
    /// The canonical page serves every version at or above its own; older
    /// versions resolve to the newest preserved image not newer than the
    /// requested version.
    pub fn data_at(&self, version: VersionId) -> Option<&[u8]> {
        if self.version_id <= version {
            return Some(&self.data);
        }
        self.snapshots
            .iter()
            .rev()
            .find(|info| info.version <= version)
            .map(|info| &*info.data)
    }

    /// Captures the canonical page as a snapshot image with `refs` owners
    /// and replaces the canonical page with a private copy for the writer.
    ///
    /// The old allocation moves into the snapshot so live pointers to the
    /// pre-write data stay valid for its owners.
    pub fn materialize_snapshot(&mut self, refs: u32) {
        debug_assert!(refs > 0, "snapshot with no owners would leak");
        debug_assert!(
            self.snapshots
                .last()
                .map_or(true, |info| info.version < self.version_id),
            "snapshot versions must ascend"
        );
        let copy = self.data.clone();
        let old = std::mem::replace(&mut self.data, copy);
        self.snapshots.push(SnapshotInfo {
            version: self.version_id,
            data: old,
            refs,
        });
    }

    /// Drops one reference to the snapshot image covering `version`.
    ///
    /// Returns true if an image was released to zero owners and removed.
    pub fn release_snapshot(&mut self, version: VersionId) -> bool {
        let index = self
            .snapshots
            .iter()
            .rposition(|info| info.version <= version)
            .expect("releasing a snapshot that was never captured");
        let info = &mut self.snapshots[index];
        assert!(info.refs > 0, "snapshot refcount underflow");
        info.refs -= 1;
        if info.refs == 0 {
            self.snapshots.remove(index);
            true
        } else {
            false
        }
    }

    /// True when the buffer can be dropped from memory: no handles, no
    /// preserved snapshots, clean, and idle.
    pub fn safe_to_unload(&self) -> bool {
        self.refcount == 0
            && self.snapshots.is_empty()
            && !self.dirty
            && !self.do_delete
            && !self.in_flush
            && self.lock.is_unlocked()
    }

    /// Bytes of page data this buffer pins in memory.
    pub fn resident_bytes(&self) -> usize {
        self.data.len() * (1 + self.snapshots.len())
    }
}

/// A held reference to one buffer under one access mode.
///
/// Handles are tokens: all data access goes through the cache, which
/// resolves the handle to the canonical page or a snapshot image. Every
/// handle must be returned with `Cache::release`; dropping one is a
/// programmer error.
#[derive(Debug)]
pub struct BufHandle {
    pub(crate) slot: BufSlot,
    pub(crate) block_id: BlockId,
    pub(crate) mode: AccessMode,
    /// Version observed at acquisition; snapshot handles resolve data
    /// through it.
    pub(crate) version: VersionId,
    /// True when the handle bypassed the lock (snapshot or outdated-ok
    /// access).
    pub(crate) non_locking: bool,
    pub(crate) txn: TxnId,
    pub(crate) released: bool,
}

impl BufHandle {
    /// The block this handle refers to.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The access mode the handle was acquired with.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// The version visible through this handle.
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// True when the handle reads without holding the buffer lock.
    pub fn is_non_locking(&self) -> bool {
        self.non_locking
    }

    /// The transaction that acquired this handle.
    pub fn txn(&self) -> TxnId {
        self.txn
    }
}

impl Drop for BufHandle {
    fn drop(&mut self) {
        if !self.released && !std::thread::panicking() {
            panic!(
                "buffer handle for {} dropped without release",
                self.block_id
            );
        }
    }
}
