//! The buffer cache core.
//!
//! The cache does no block I/O logic of its own; it coordinates the page
//! map, free list, replacement policy, patch stores and write-back into a
//! coherent whole over one serializer. A cache lives on one home worker:
//! every operation takes `&mut self`, and deferred completions (lock
//! grants, commits) fire their callbacks exactly once on that worker.

use crate::buf::{AccessMode, BufHandle, InnerBuf};
use crate::free_list::FreeList;
use crate::page_map::{BufSlot, PageMap};
use crate::page_repl::PageRepl;
use crate::patch_disk::PatchDiskStorage;
use crate::patch_store::PatchMemoryStore;
use crate::rwi_lock::{LockAcquire, LockMode, Ticket};
use crate::transaction::{Transaction, TxnId, TxnState};
use crate::writeback::{FlushReport, WriteBack};
use bytes::Bytes;
use nimbus_common::{BlockId, CacheConfig, NimbusError, Patch, Result, SerTxnId, VersionId};
use nimbus_storage::{Serializer, WritePayload};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Callback completing a deferred acquire. Runs exactly once, on the
/// cache's home worker, after the buffer lock is granted.
pub type AcquireCallback = Box<dyn FnOnce(Result<BufHandle>)>;

struct PendingAcquire {
    txn: TxnId,
    mode: AccessMode,
    callback: AcquireCallback,
}

/// Point-in-time counters over the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Blocks resident in the page map.
    pub resident_blocks: usize,
    /// Resident blocks awaiting write-back.
    pub dirty_blocks: usize,
    /// Preserved snapshot page images.
    pub snapshot_pages: usize,
    /// Bytes pinned by canonical and snapshot pages.
    pub resident_bytes: usize,
    /// Live transactions.
    pub live_transactions: usize,
    /// Registered snapshot versions.
    pub active_snapshots: usize,
}

/// The mirrored buffer cache.
pub struct Cache {
    config: CacheConfig,
    serializer: Box<dyn Serializer>,
    block_size: usize,
    page_map: PageMap,
    free_list: FreeList,
    page_repl: PageRepl,
    writeback: WriteBack,
    patch_memory: PatchMemoryStore,
    patch_disk: PatchDiskStorage,
    txns: HashMap<u64, Transaction>,
    next_txn_id: u64,
    /// Active snapshot version -> owning transaction, ordered so COW can
    /// range-scan the versions that must keep old data alive.
    active_snapshots: BTreeMap<VersionId, TxnId>,
    next_snapshot_version: VersionId,
    /// Logical clock stamped onto buffers at each acquire.
    access_clock: u64,
    lock_waiters: HashMap<(usize, Ticket), PendingAcquire>,
    shutting_down: bool,
}

impl Cache {
    /// Builds a cache over `serializer`, replaying the mirrored patch log
    /// from the reserved range.
    pub fn new(mut serializer: Box<dyn Serializer>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let block_size = serializer.block_size();
        if block_size == 0 || block_size > u16::MAX as usize + 1 {
            return Err(NimbusError::Config(format!(
                "unsupported serializer block size {block_size}"
            )));
        }

        let patch_disk = PatchDiskStorage::new(
            BlockId::FIRST_PATCH_BLOCK,
            PatchDiskStorage::DEFAULT_NUM_BLOCKS,
        );
        let first_data_block = serializer.end_block_id().max(patch_disk.end_block());

        let mut patch_memory = PatchMemoryStore::new();
        for patch in patch_disk.load(&mut *serializer)? {
            patch_memory.store(patch);
        }
        debug!(
            block_size,
            first_data_block = %first_data_block,
            replayed_patches = patch_memory.total_size(),
            "cache attached to serializer"
        );

        let sample_size = config.eviction_sample_size;
        Ok(Self {
            config,
            serializer,
            block_size,
            page_map: PageMap::new(),
            free_list: FreeList::new(first_data_block),
            page_repl: PageRepl::new(sample_size),
            writeback: WriteBack::new(),
            patch_memory,
            patch_disk,
            txns: HashMap::new(),
            next_txn_id: 1,
            active_snapshots: BTreeMap::new(),
            next_snapshot_version: VersionId::FIRST,
            access_clock: 0,
            lock_waiters: HashMap::new(),
            shutting_down: false,
        })
    }

    /// The serializer's fixed block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The version the next snapshot or write transaction will take.
    pub fn current_version(&self) -> VersionId {
        self.next_snapshot_version
    }

    fn allocate_version(&mut self) -> VersionId {
        let version = self.next_snapshot_version;
        self.next_snapshot_version = version.next();
        version
    }

    fn txn(&self, id: TxnId) -> &Transaction {
        self.txns.get(&id.0).expect("not a live transaction")
    }

    fn txn_mut(&mut self, id: TxnId) -> &mut Transaction {
        self.txns.get_mut(&id.0).expect("not a live transaction")
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Opens a transaction. Write transactions take the version their
    /// writes will stamp onto blocks.
    pub fn begin_transaction(&mut self, access: AccessMode) -> TxnId {
        assert!(!self.shutting_down, "transaction begun during shutdown");
        assert!(
            matches!(access, AccessMode::Read | AccessMode::Write),
            "transaction access must be read or write"
        );

        let id = TxnId(self.next_txn_id);
        self.next_txn_id += 1;
        let version = if access == AccessMode::Write {
            self.allocate_version()
        } else {
            VersionId::NULL
        };
        self.txns.insert(id.0, Transaction::new(id, access, version));
        id
    }

    /// Turns an open read transaction into a snapshot at the cache's
    /// current version. Returns the snapshot version.
    pub fn snapshot(&mut self, txn: TxnId) -> VersionId {
        let version = {
            let t = self.txn(txn);
            assert!(t.is_open(), "snapshot on a transaction that is not open");
            assert_eq!(t.access, AccessMode::Read, "snapshot requires a read transaction");
            assert!(!t.snapshotted, "transaction is already snapshotted");
            self.allocate_version()
        };

        let t = self.txn_mut(txn);
        t.snapshotted = true;
        t.version = version;
        self.active_snapshots.insert(version, txn);
        version
    }

    /// Commits `txn`. The callback fires exactly once: immediately for
    /// read transactions and changeless writes, otherwise when the
    /// write-back cycle that persists the changes completes, or fails for
    /// good.
    pub fn commit(&mut self, txn: TxnId, callback: impl FnOnce(Result<()>) + 'static) {
        {
            let t = self.txn(txn);
            assert!(t.is_open(), "commit on a transaction that is not open");
            assert_eq!(t.live_handles, 0, "commit with outstanding buffer handles");
            assert_eq!(t.pending_acquires, 0, "commit with queued acquires");
        }

        let access = self.txn(txn).access;
        if access == AccessMode::Read {
            self.retire_read_txn(txn);
            callback(Ok(()));
            return;
        }

        let t = self.txn_mut(txn);
        t.state = TxnState::InCommit;
        t.commit_callback = Some(Box::new(callback));

        // Write-back acceptance: with no capture in progress on the home
        // worker the green light is immediate.
        let t = self.txn_mut(txn);
        t.state = TxnState::Committing;
        if t.made_changes {
            self.writeback.add_sync_waiter(txn);
        } else {
            let mut t = self.txns.remove(&txn.0).expect("not a live transaction");
            t.state = TxnState::Committed;
            let cb = t.commit_callback.take().expect("commit callback vanished");
            cb(Ok(()));
        }
    }

    fn retire_read_txn(&mut self, txn: TxnId) {
        let mut t = self.txns.remove(&txn.0).expect("not a live transaction");
        if t.snapshotted {
            self.active_snapshots.remove(&t.version);
        }
        for (slot, version) in t.owned_snapshots.drain(..) {
            if self.page_map.buf_mut(slot).release_snapshot(version) {
                self.maybe_dispose_deleted(slot);
            }
        }
        t.state = TxnState::Committed;
    }

    /// Disposes a deletion-flushed buffer once nothing references it.
    fn maybe_dispose_deleted(&mut self, slot: BufSlot) {
        let buf = self.page_map.buf(slot);
        if buf.do_delete
            && !buf.dirty
            && buf.refcount == 0
            && buf.snapshots.is_empty()
            && self.page_map.get(buf.block_id).is_none()
        {
            self.page_map.dispose(slot);
        }
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Acquires `block_id` for `txn` under `mode`.
    ///
    /// Returns `Ok(Some(handle))` when the access is immediately ready;
    /// otherwise the acquire is queued on the buffer lock and `on_ready`
    /// fires exactly once when it is granted. Transactions touching
    /// several blocks for write must acquire them in ascending block-id
    /// order; converging writers are deadlock-free only under that
    /// discipline.
    pub fn acquire(
        &mut self,
        txn: TxnId,
        block_id: BlockId,
        mode: AccessMode,
        on_ready: impl FnOnce(Result<BufHandle>) + 'static,
    ) -> Result<Option<BufHandle>> {
        {
            let t = self.txn(txn);
            assert!(t.is_open(), "acquire on a transaction that is not open");
            if mode == AccessMode::Write {
                assert_eq!(t.access, AccessMode::Write, "write acquire in a read transaction");
            }
            if t.snapshotted {
                assert_eq!(mode, AccessMode::Read, "snapshotted transactions read only");
            }
        }
        #[cfg(debug_assertions)]
        if mode == AccessMode::Write {
            let t = self.txn_mut(txn);
            if let Some(last) = t.last_write_block {
                debug_assert!(
                    block_id >= last,
                    "write acquires must use ascending block-id order"
                );
            }
            t.last_write_block = Some(block_id);
        }

        let slot = self.ensure_resident(block_id)?;
        assert!(
            !self.page_map.buf(slot).do_delete,
            "acquiring a block flagged for deletion"
        );

        if self.txn(txn).snapshotted {
            let version = self.txn(txn).version;
            if self.page_map.buf(slot).data_at(version).is_none() {
                return Err(NimbusError::SnapshotVersionUnavailable { block_id, version });
            }
            let buf = self.page_map.buf_mut(slot);
            buf.refcount += 1;
            self.touch(slot);
            self.txn_mut(txn).live_handles += 1;
            return Ok(Some(BufHandle {
                slot,
                block_id,
                mode: AccessMode::Read,
                version,
                non_locking: true,
                txn,
                released: false,
            }));
        }

        if mode == AccessMode::ReadOutdatedOk {
            let buf = self.page_map.buf_mut(slot);
            buf.refcount += 1;
            buf.cow_refs += 1;
            let version = buf.version_id;
            self.touch(slot);
            self.txn_mut(txn).live_handles += 1;
            return Ok(Some(BufHandle {
                slot,
                block_id,
                mode,
                version,
                non_locking: true,
                txn,
                released: false,
            }));
        }

        let lock_mode = match mode {
            AccessMode::Read => LockMode::Read,
            AccessMode::Write => LockMode::Write,
            AccessMode::ReadOutdatedOk => unreachable!(),
        };
        self.page_map.buf_mut(slot).refcount += 1;
        match self.page_map.buf_mut(slot).lock.acquire(lock_mode) {
            LockAcquire::Granted => {
                self.txn_mut(txn).live_handles += 1;
                Ok(Some(self.finish_acquire(slot, txn, mode)))
            }
            LockAcquire::Queued(ticket) => {
                self.txn_mut(txn).pending_acquires += 1;
                self.lock_waiters.insert(
                    (slot.0, ticket),
                    PendingAcquire {
                        txn,
                        mode,
                        callback: Box::new(on_ready),
                    },
                );
                Ok(None)
            }
        }
    }

    /// Allocates a fresh block in `txn`, write-acquired and flagged for a
    /// full flush.
    pub fn allocate(&mut self, txn: TxnId) -> Result<BufHandle> {
        let version = {
            let t = self.txn(txn);
            assert!(t.is_open(), "allocate on a transaction that is not open");
            assert_eq!(t.access, AccessMode::Write, "allocate requires a write transaction");
            t.version
        };

        let block_id = self.free_list.allocate();
        let buf = InnerBuf::new(block_id, vec![0u8; self.block_size].into(), version);
        let slot = self.page_map.insert(buf);

        let buf = self.page_map.buf_mut(slot);
        match buf.lock.acquire(LockMode::Write) {
            LockAcquire::Granted => {}
            LockAcquire::Queued(_) => unreachable!("fresh buffer lock was contended"),
        }
        buf.refcount = 1;
        buf.needs_full_flush = true;
        self.mark_dirty(slot);
        self.touch(slot);

        let t = self.txn_mut(txn);
        t.made_changes = true;
        t.live_handles += 1;
        #[cfg(debug_assertions)]
        {
            t.last_write_block = Some(block_id);
        }

        self.evict_excess_excluding(Some(block_id));
        Ok(BufHandle {
            slot,
            block_id,
            mode: AccessMode::Write,
            version,
            non_locking: false,
            txn,
            released: false,
        })
    }

    /// Loads `block_id` into the page map if absent.
    fn ensure_resident(&mut self, block_id: BlockId) -> Result<BufSlot> {
        if let Some(slot) = self.page_map.get(block_id) {
            return Ok(slot);
        }
        if !self.serializer.block_in_use(block_id) {
            return Err(NimbusError::BlockNotFound { block_id });
        }

        let mut data = vec![0u8; self.block_size];
        // A corrupt block surfaces here and the buffer is never published.
        self.serializer.read(block_id, &mut data)?;
        self.patch_memory.apply_to(block_id, &mut data)?;

        let slot = self
            .page_map
            .insert(InnerBuf::new(block_id, data.into(), VersionId::NULL));
        self.evict_excess_excluding(Some(block_id));
        Ok(slot)
    }

    /// Completes a granted locking acquire: stamps recency and, for
    /// writers, runs the copy-on-write point.
    fn finish_acquire(&mut self, slot: BufSlot, txn: TxnId, mode: AccessMode) -> BufHandle {
        self.touch(slot);

        if mode == AccessMode::Write {
            let change_version = self.txn(txn).version;
            let (old_version, cow_refs) = {
                let buf = self.page_map.buf(slot);
                (buf.version_id, buf.cow_refs)
            };

            if old_version < change_version {
                // Every active snapshot in [old, change) must keep seeing
                // the pre-write page, as must live outdated-ok readers.
                let snapshot_txns: Vec<TxnId> = self
                    .active_snapshots
                    .range(old_version..change_version)
                    .map(|(_, &id)| id)
                    .collect();
                let refs = snapshot_txns.len() as u32 + cow_refs;
                for snapshot_txn in snapshot_txns {
                    self.txn_mut(snapshot_txn)
                        .owned_snapshots
                        .push((slot, old_version));
                }

                let buf = self.page_map.buf_mut(slot);
                if refs > 0 {
                    buf.materialize_snapshot(refs);
                    buf.cow_refs = 0;
                }
                buf.version_id = change_version;
            }
        }

        let buf = self.page_map.buf(slot);
        BufHandle {
            slot,
            block_id: buf.block_id,
            mode,
            version: buf.version_id,
            non_locking: false,
            txn,
            released: false,
        }
    }

    fn touch(&mut self, slot: BufSlot) {
        self.access_clock += 1;
        self.page_map.buf_mut(slot).subtree_recency = self.access_clock;
    }

    /// Releases a handle: drops the refcount, releases the lock or
    /// snapshot reference, and completes any acquires the lock release
    /// granted.
    pub fn release(&mut self, mut handle: BufHandle) {
        assert!(!handle.released, "buffer handle released twice");
        handle.released = true;
        let slot = handle.slot;

        self.txn_mut(handle.txn).live_handles -= 1;
        {
            let buf = self.page_map.buf_mut(slot);
            assert!(buf.refcount > 0, "buffer refcount underflow");
            buf.refcount -= 1;
        }

        if handle.non_locking {
            if handle.mode == AccessMode::ReadOutdatedOk {
                let buf = self.page_map.buf_mut(slot);
                if buf.version_id > handle.version {
                    // The page this handle was reading moved into a
                    // snapshot image at the copy-on-write point.
                    if buf.release_snapshot(handle.version) {
                        self.maybe_dispose_deleted(slot);
                    }
                } else {
                    assert!(buf.cow_refs > 0, "outdated-ok refcount underflow");
                    buf.cow_refs -= 1;
                }
            }
            return;
        }

        let lock_mode = match handle.mode {
            AccessMode::Read => LockMode::Read,
            AccessMode::Write => LockMode::Write,
            AccessMode::ReadOutdatedOk => unreachable!("outdated-ok never locks"),
        };
        let granted = self.page_map.buf_mut(slot).lock.release(lock_mode);
        for (ticket, _mode) in granted {
            let pending = self
                .lock_waiters
                .remove(&(slot.0, ticket))
                .expect("granted ticket without a waiter");
            self.txn_mut(pending.txn).pending_acquires -= 1;
            self.txn_mut(pending.txn).live_handles += 1;
            let ready = self.finish_acquire(slot, pending.txn, pending.mode);
            (pending.callback)(Ok(ready));
        }
    }

    // ------------------------------------------------------------------
    // Data access
    // ------------------------------------------------------------------

    fn assert_write_handle(&self, handle: &BufHandle) {
        assert!(!handle.released, "handle already released");
        assert_eq!(handle.mode, AccessMode::Write, "mutation requires a write handle");
        assert!(!handle.non_locking, "mutation through a non-locking handle");
    }

    /// The page image visible through `handle`.
    pub fn buf_data<'a>(&'a self, handle: &BufHandle) -> &'a [u8] {
        assert!(!handle.released, "handle already released");
        let buf = self.page_map.buf(handle.slot);
        if handle.non_locking {
            buf.data_at(handle.version)
                .expect("snapshot data disappeared while handle was live")
        } else {
            &buf.data
        }
    }

    /// Applies a small in-place edit through a write handle, recording it
    /// in the patch log.
    pub fn apply_patch(&mut self, handle: &BufHandle, offset: usize, data: &[u8]) -> Result<()> {
        self.assert_write_handle(handle);
        if offset + data.len() > self.block_size || data.len() > Patch::MAX_DATA_SIZE {
            return Err(NimbusError::PatchOutOfBounds {
                block_id: handle.block_id,
                offset,
                len: data.len(),
                block_size: self.block_size,
            });
        }

        let buf = self.page_map.buf_mut(handle.slot);
        let counter = buf.allocate_patch_counter();
        let patch = Patch::new(
            handle.block_id,
            counter,
            offset as u16,
            Bytes::copy_from_slice(data),
        );
        patch.apply(&mut buf.data)?;
        // After a major write the patch log is superseded by the full
        // image; recording would reintroduce the stale-patch race.
        if !buf.needs_full_flush {
            self.patch_memory.store(patch);
        }

        self.mark_dirty(handle.slot);
        self.txn_mut(handle.txn).made_changes = true;
        Ok(())
    }

    /// Copies `data` into the block at `offset`. Equivalent to a patch.
    pub fn set_data(&mut self, handle: &BufHandle, offset: usize, data: &[u8]) -> Result<()> {
        self.apply_patch(handle, offset, data)
    }

    /// Moves `len` bytes within the block. Equivalent to a patch at the
    /// destination offset.
    pub fn move_data(
        &mut self,
        handle: &BufHandle,
        dest_offset: usize,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.assert_write_handle(handle);
        if src_offset + len > self.block_size {
            return Err(NimbusError::PatchOutOfBounds {
                block_id: handle.block_id,
                offset: src_offset,
                len,
                block_size: self.block_size,
            });
        }
        let moved = {
            let buf = self.page_map.buf(handle.slot);
            Bytes::copy_from_slice(&buf.data[src_offset..src_offset + len])
        };
        self.apply_patch(handle, dest_offset, &moved)
    }

    /// Write access to the whole page, bypassing the patch log.
    ///
    /// The block's pending patches are dropped immediately: a full-image
    /// mutation plus stale patches must never be observable together. The
    /// block is flushed in full this cycle.
    pub fn get_data_major_write<'a>(&'a mut self, handle: &BufHandle) -> &'a mut [u8] {
        self.assert_write_handle(handle);
        self.patch_memory.drop_block(handle.block_id);
        self.mark_dirty(handle.slot);
        self.txn_mut(handle.txn).made_changes = true;

        let buf = self.page_map.buf_mut(handle.slot);
        buf.needs_full_flush = true;
        &mut buf.data
    }

    /// Forces the next flush of this block to write the full image
    /// instead of patches.
    pub fn ensure_flush(&mut self, handle: &BufHandle) {
        self.assert_write_handle(handle);
        self.page_map.buf_mut(handle.slot).needs_full_flush = true;
    }

    /// Flags the block for deletion at the next flush.
    pub fn mark_deleted(&mut self, handle: &BufHandle, write_null: bool) {
        self.assert_write_handle(handle);
        self.patch_memory.drop_block(handle.block_id);
        {
            let buf = self.page_map.buf_mut(handle.slot);
            buf.do_delete = true;
            buf.write_empty_deleted_block = write_null;
        }
        self.mark_dirty(handle.slot);
        self.txn_mut(handle.txn).made_changes = true;
    }

    /// Refreshes the block's recency stamp.
    pub fn touch_recency(&mut self, handle: &BufHandle) {
        assert!(!handle.released, "handle already released");
        self.touch(handle.slot);
    }

    /// True if the block has unflushed changes.
    pub fn is_dirty(&self, handle: &BufHandle) -> bool {
        self.page_map.buf(handle.slot).dirty
    }

    fn mark_dirty(&mut self, slot: BufSlot) {
        let buf = self.page_map.buf_mut(slot);
        if !buf.dirty {
            buf.dirty = true;
            self.writeback.enlist(slot);
        }
    }

    // ------------------------------------------------------------------
    // Write-back
    // ------------------------------------------------------------------

    /// Runs one write-back cycle: mirrors the patch log, persists the
    /// captured dirty set, and completes or fails committing
    /// transactions.
    pub fn flush(&mut self) -> Result<FlushReport> {
        assert!(!self.writeback.flush_in_progress, "flush cycle re-entered");
        self.writeback.flush_in_progress = true;
        let report = self.flush_inner();
        self.writeback.flush_in_progress = false;
        self.writeback.note_flushed(Instant::now());
        report
    }

    fn flush_inner(&mut self) -> Result<FlushReport> {
        let captured = self.writeback.take_dirty();
        let ser_txn = self.serializer.allocate_txn_id();
        let mut report = FlushReport::default();

        // Mirror the pending patch log first so a crash between here and
        // the data-block writes can replay the edits. Blocks whose
        // patches did not fit must be written in full.
        let mut force_full: Vec<BlockId> = Vec::new();
        let mut patch_mirror_ok = true;
        match self
            .patch_disk
            .store(&mut *self.serializer, &self.patch_memory, ser_txn)
        {
            Ok(overflow) => force_full = overflow,
            Err(e) => {
                warn!(error = %e, "patch log mirror write failed, forcing full flushes");
                patch_mirror_ok = false;
            }
        }

        let mut exhausted: Option<(BlockId, String)> = None;
        for slot in captured {
            let (block_id, do_delete, write_empty, needs_full, still_dirty, refcount) = {
                let buf = self.page_map.buf(slot);
                (
                    buf.block_id,
                    buf.do_delete,
                    buf.write_empty_deleted_block,
                    buf.needs_full_flush,
                    buf.dirty,
                    buf.refcount,
                )
            };
            if !still_dirty {
                continue;
            }

            if do_delete && refcount > 0 {
                // The deleting writer still holds the buffer; try again
                // next cycle.
                self.writeback.enlist(slot);
                report.retained_dirty += 1;
                continue;
            }

            let patch_bytes = self.patch_memory.block_patch_size(block_id);
            let ratio_exceeded = patch_bytes as u64
                * self.config.max_patches_size_ratio as u64
                > self.block_size as u64;
            let write_full = needs_full
                || !patch_mirror_ok
                || ratio_exceeded
                || force_full.contains(&block_id)
                || patch_bytes == 0;

            self.page_map.buf_mut(slot).in_flush = true;
            let result = if do_delete {
                self.serializer.write(
                    block_id,
                    WritePayload::Delete {
                        write_zero_block: write_empty,
                    },
                    ser_txn,
                )
            } else if write_full {
                let Self {
                    serializer,
                    page_map,
                    ..
                } = &mut *self;
                serializer.write(block_id, WritePayload::Full(&page_map.buf(slot).data), ser_txn)
            } else {
                let Self {
                    serializer,
                    patch_memory,
                    ..
                } = &mut *self;
                let patches = patch_memory
                    .patches_for(block_id)
                    .expect("patch flush without patches");
                serializer.write(block_id, WritePayload::Patches(patches), ser_txn)
            };

            match result {
                Ok(()) => {
                    {
                        let buf = self.page_map.buf_mut(slot);
                        buf.dirty = false;
                        buf.in_flush = false;
                        buf.needs_full_flush = false;
                        buf.flush_attempts = 0;
                        buf.ser_txn_id = ser_txn;
                    }
                    self.patch_memory.drop_block(block_id);

                    if do_delete {
                        report.deletes += 1;
                        self.free_list.release(block_id);
                        self.page_map.unindex(block_id);
                        self.maybe_dispose_deleted(slot);
                    } else if write_full {
                        report.full_writes += 1;
                    } else {
                        report.patch_writes += 1;
                    }
                }
                Err(e) => {
                    let attempts = {
                        let buf = self.page_map.buf_mut(slot);
                        buf.in_flush = false;
                        buf.flush_attempts += 1;
                        buf.flush_attempts
                    };
                    warn!(
                        block = %block_id,
                        attempts,
                        error = %e,
                        "serializer write failed, block stays dirty"
                    );
                    report.write_failures += 1;
                    report.retained_dirty += 1;
                    self.writeback.enlist(slot);
                    if attempts >= self.config.max_flush_attempts && exhausted.is_none() {
                        exhausted = Some((block_id, e.to_string()));
                    }
                }
            }
        }

        self.serializer.sync()?;

        if let Some((block_id, reason)) = exhausted {
            // Bounded retries are spent: fail the committing transactions.
            // Dirty bits stay set, so the cache remains consistent and
            // later cycles keep trying.
            let attempts = self.config.max_flush_attempts;
            for txn in self.writeback.take_sync_waiters() {
                let mut t = self.txns.remove(&txn.0).expect("not a live transaction");
                let cb = t.commit_callback.take().expect("commit callback vanished");
                cb(Err(NimbusError::WriteBackFailed {
                    block_id,
                    attempts,
                    reason: reason.clone(),
                }));
            }
            self.reset_flush_attempts();
        } else if report.is_clean() {
            for txn in self.writeback.take_sync_waiters() {
                let mut t = self.txns.remove(&txn.0).expect("not a live transaction");
                t.state = TxnState::Committed;
                let cb = t.commit_callback.take().expect("commit callback vanished");
                cb(Ok(()));
            }
        }

        Ok(report)
    }

    fn reset_flush_attempts(&mut self) {
        let mut slots = Vec::new();
        self.page_map.for_each_slot(|slot, buf| {
            if buf.flush_attempts > 0 {
                slots.push(slot);
            }
        });
        for slot in slots {
            self.page_map.buf_mut(slot).flush_attempts = 0;
        }
    }

    /// Time-based driver: runs a flush when the interval or dirty
    /// threshold demands one, then rebalances memory.
    pub fn tick(&mut self, now: Instant) -> Result<Option<FlushReport>> {
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        let report = if self
            .writeback
            .should_flush(now, interval, self.config.flush_dirty_threshold)
        {
            Some(self.flush()?)
        } else {
            None
        };
        self.evict_excess();
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Replacement
    // ------------------------------------------------------------------

    /// Bytes currently pinned by canonical and snapshot pages.
    pub fn resident_bytes(&self) -> usize {
        let mut total = 0;
        self.page_map
            .for_each_slot(|_slot, buf| total += buf.resident_bytes());
        total
    }

    /// Evicts clean, unreferenced buffers until the memory target is met.
    /// Returns the number of buffers unloaded.
    pub fn evict_excess(&mut self) -> usize {
        self.evict_excess_excluding(None)
    }

    fn evict_excess_excluding(&mut self, exclude: Option<BlockId>) -> usize {
        let target = self.config.target_memory_bytes;
        let mut evicted = 0;
        while self.resident_bytes() > target {
            let victim = self.page_repl.pick_victim(&self.page_map, |buf| {
                buf.safe_to_unload() && Some(buf.block_id) != exclude
            });
            let Some(slot) = victim else {
                break;
            };
            let buf = self.page_map.dispose(slot);
            debug!(block = %buf.block_id, "evicted block");
            evicted += 1;
        }
        evicted
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Counters over the current cache state.
    pub fn stats(&self) -> CacheStats {
        let mut dirty_blocks = 0;
        let mut snapshot_pages = 0;
        let mut resident_bytes = 0;
        self.page_map.for_each_slot(|_slot, buf| {
            if buf.dirty {
                dirty_blocks += 1;
            }
            snapshot_pages += buf.snapshots.len();
            resident_bytes += buf.resident_bytes();
        });
        CacheStats {
            resident_blocks: self.page_map.len(),
            dirty_blocks,
            snapshot_pages,
            resident_bytes,
            live_transactions: self.txns.len(),
            active_snapshots: self.active_snapshots.len(),
        }
    }

    /// True if the block is resident in the page map.
    pub fn is_resident(&self, block_id: BlockId) -> bool {
        self.page_map.get(block_id).is_some()
    }

    /// The canonical version of a resident block.
    pub fn block_version(&self, block_id: BlockId) -> Option<VersionId> {
        self.page_map
            .get(block_id)
            .map(|slot| self.page_map.buf(slot).version_id)
    }

    /// The serializer transaction of a resident block's last completed
    /// flush.
    pub fn block_last_flush_txn(&self, block_id: BlockId) -> Option<SerTxnId> {
        self.page_map
            .get(block_id)
            .map(|slot| self.page_map.buf(slot).ser_txn_id)
    }

    /// Versions of the preserved snapshot images of a resident block.
    pub fn block_snapshot_versions(&self, block_id: BlockId) -> Vec<VersionId> {
        match self.page_map.get(block_id) {
            Some(slot) => self
                .page_map
                .buf(slot)
                .snapshots
                .iter()
                .map(|info| info.version)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Flushes everything and detaches from the serializer.
    ///
    /// Panics if transactions are still live; callers own transaction
    /// lifecycle and must retire them first.
    pub fn shutdown(mut self) -> Result<()> {
        assert!(self.txns.is_empty(), "shutdown with live transactions");
        self.shutting_down = true;
        let report = self.flush()?;
        if !report.is_clean() {
            return Err(NimbusError::Internal(format!(
                "{} blocks still dirty at shutdown",
                report.retained_dirty
            )));
        }
        self.serializer.sync()?;
        Ok(())
    }
}
