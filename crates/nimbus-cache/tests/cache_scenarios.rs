//! End-to-end cache scenarios over a fault-injectable serializer.

use nimbus_cache::{AccessMode, BufHandle, Cache, TxnId};
use nimbus_common::{BlockId, CacheConfig, NimbusError, Result, SerTxnId, VersionId};
use nimbus_storage::{MemSerializer, Serializer, WritePayload};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

const BLOCK_SIZE: usize = 64;

/// Serializer handle the test keeps a side door into, for fault injection
/// and image inspection while the cache owns the boxed copy.
#[derive(Clone)]
struct SharedSerializer(Arc<Mutex<MemSerializer>>);

impl SharedSerializer {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(MemSerializer::new(BLOCK_SIZE))))
    }

    fn fail_next_writes(&self, n: u32) {
        self.0.lock().unwrap().fail_next_writes(n);
    }

    fn block_image(&self, block_id: BlockId) -> Option<Vec<u8>> {
        self.0.lock().unwrap().block_image(block_id)
    }
}

impl Serializer for SharedSerializer {
    fn block_size(&self) -> usize {
        self.0.lock().unwrap().block_size()
    }

    fn end_block_id(&self) -> BlockId {
        self.0.lock().unwrap().end_block_id()
    }

    fn block_in_use(&self, block_id: BlockId) -> bool {
        self.0.lock().unwrap().block_in_use(block_id)
    }

    fn read(&mut self, block_id: BlockId, buf: &mut [u8]) -> Result<()> {
        self.0.lock().unwrap().read(block_id, buf)
    }

    fn write(
        &mut self,
        block_id: BlockId,
        payload: WritePayload<'_>,
        txn_id: SerTxnId,
    ) -> Result<()> {
        self.0.lock().unwrap().write(block_id, payload, txn_id)
    }

    fn allocate_txn_id(&mut self) -> SerTxnId {
        self.0.lock().unwrap().allocate_txn_id()
    }

    fn sync(&mut self) -> Result<()> {
        self.0.lock().unwrap().sync()
    }
}

fn test_config() -> CacheConfig {
    CacheConfig {
        target_memory_bytes: 1024 * 1024,
        flush_interval_ms: 1_000,
        flush_dirty_threshold: 512,
        max_patches_size_ratio: 2,
        eviction_sample_size: 16,
        max_flush_attempts: 3,
    }
}

fn cache_over(serializer: &SharedSerializer, config: CacheConfig) -> Cache {
    Cache::new(Box::new(serializer.clone()), config).unwrap()
}

fn commit_and_flush(cache: &mut Cache, txn: TxnId) {
    let done = Rc::new(RefCell::new(None));
    let seen = Rc::clone(&done);
    cache.commit(txn, move |result| *seen.borrow_mut() = Some(result.is_ok()));
    cache.flush().unwrap();
    assert_eq!(*done.borrow(), Some(true));
}

fn write_block(cache: &mut Cache, fill: u8) -> BlockId {
    let txn = cache.begin_transaction(AccessMode::Write);
    let handle = cache.allocate(txn).unwrap();
    let block_id = handle.block_id();
    cache.get_data_major_write(&handle).fill(fill);
    cache.release(handle);
    commit_and_flush(cache, txn);
    block_id
}

fn sync_acquire(cache: &mut Cache, txn: TxnId, block_id: BlockId, mode: AccessMode) -> BufHandle {
    cache
        .acquire(txn, block_id, mode, |_| panic!("acquire was deferred"))
        .unwrap()
        .expect("acquire was not ready")
}

/// Burns write-transaction versions so the cache reaches `version`.
fn advance_to_version(cache: &mut Cache, version: u64) {
    while cache.current_version() < VersionId(version) {
        let txn = cache.begin_transaction(AccessMode::Write);
        let fired = Rc::new(RefCell::new(false));
        let seen = Rc::clone(&fired);
        cache.commit(txn, move |r| {
            r.unwrap();
            *seen.borrow_mut() = true;
        });
        assert!(*fired.borrow());
    }
}

/// S4: a write acquisition under an active snapshot materializes the
/// pre-write image and bumps the canonical version.
#[test]
fn cow_snapshot_preserves_prewrite_image() {
    let serializer = SharedSerializer::new();
    let mut cache = cache_over(&serializer, test_config());

    // Block holding 0xAA, then advance the cache to version 5.
    let block_id = write_block(&mut cache, 0xAA);
    advance_to_version(&mut cache, 5);
    assert_eq!(cache.current_version(), VersionId(5));

    // One active snapshot at version 5.
    let reader = cache.begin_transaction(AccessMode::Read);
    let snapshot_version = cache.snapshot(reader);
    assert_eq!(snapshot_version, VersionId(5));

    // Write acquisition: the 0xAA image is preserved and the canonical
    // buffer moves to version 6.
    let writer = cache.begin_transaction(AccessMode::Write);
    let handle = sync_acquire(&mut cache, writer, block_id, AccessMode::Write);
    assert_eq!(cache.block_version(block_id), Some(VersionId(6)));
    assert_eq!(cache.block_snapshot_versions(block_id).len(), 1);
    assert_eq!(cache.stats().snapshot_pages, 1);

    cache.apply_patch(&handle, 0, &[0xBB; 8]).unwrap();
    cache.release(handle);

    // The snapshot reader still sees 0xAA everywhere.
    let snap_handle = sync_acquire(&mut cache, reader, block_id, AccessMode::Read);
    assert!(snap_handle.is_non_locking());
    assert!(cache.buf_data(&snap_handle).iter().all(|&b| b == 0xAA));
    cache.release(snap_handle);

    commit_and_flush(&mut cache, writer);
    cache.commit(reader, |r| r.unwrap());

    // Snapshot retirement releases the preserved image.
    assert_eq!(cache.stats().snapshot_pages, 0);
    cache.shutdown().unwrap();
}

/// Property 5: a snapshot at version V observes exactly the bytes from
/// before the first write at a version above V, across repeated writes.
#[test]
fn snapshot_isolation_across_repeated_writes() {
    let serializer = SharedSerializer::new();
    let mut cache = cache_over(&serializer, test_config());
    let block_id = write_block(&mut cache, 0x11);

    let reader = cache.begin_transaction(AccessMode::Read);
    cache.snapshot(reader);

    for fill in [0x22u8, 0x33, 0x44] {
        let writer = cache.begin_transaction(AccessMode::Write);
        let handle = sync_acquire(&mut cache, writer, block_id, AccessMode::Write);
        cache.get_data_major_write(&handle).fill(fill);
        cache.release(handle);
        commit_and_flush(&mut cache, writer);
    }

    // Only the first write needed to preserve an image for this snapshot.
    assert_eq!(cache.stats().snapshot_pages, 1);

    let snap_handle = sync_acquire(&mut cache, reader, block_id, AccessMode::Read);
    assert!(cache.buf_data(&snap_handle).iter().all(|&b| b == 0x11));
    cache.release(snap_handle);
    cache.commit(reader, |r| r.unwrap());

    // Current readers see the last write.
    let txn = cache.begin_transaction(AccessMode::Read);
    let handle = sync_acquire(&mut cache, txn, block_id, AccessMode::Read);
    assert!(cache.buf_data(&handle).iter().all(|&b| b == 0x44));
    cache.release(handle);
    cache.commit(txn, |r| r.unwrap());
    cache.shutdown().unwrap();
}

/// An outdated-ok reader keeps its pre-write view without blocking the
/// writer.
#[test]
fn outdated_ok_reader_survives_cow() {
    let serializer = SharedSerializer::new();
    let mut cache = cache_over(&serializer, test_config());
    let block_id = write_block(&mut cache, 0x77);

    let reader = cache.begin_transaction(AccessMode::Read);
    let outdated = sync_acquire(&mut cache, reader, block_id, AccessMode::ReadOutdatedOk);
    assert!(outdated.is_non_locking());

    // The writer is not blocked by the outdated-ok hold.
    let writer = cache.begin_transaction(AccessMode::Write);
    let write_handle = sync_acquire(&mut cache, writer, block_id, AccessMode::Write);
    cache.get_data_major_write(&write_handle).fill(0x88);

    assert!(cache.buf_data(&outdated).iter().all(|&b| b == 0x77));
    assert!(cache.buf_data(&write_handle).iter().all(|&b| b == 0x88));

    cache.release(write_handle);
    cache.release(outdated);
    assert_eq!(cache.stats().snapshot_pages, 0);

    commit_and_flush(&mut cache, writer);
    cache.commit(reader, |r| r.unwrap());
    cache.shutdown().unwrap();
}

/// S5: a failed serializer write keeps the block dirty, the next cycle
/// retries, and the commit callback fires only after success.
#[test]
fn writeback_retries_failed_write() {
    let serializer = SharedSerializer::new();
    let mut cache = cache_over(&serializer, test_config());

    let txn = cache.begin_transaction(AccessMode::Write);
    let handle = cache.allocate(txn).unwrap();
    let block_id = handle.block_id();
    cache.get_data_major_write(&handle).fill(0xCD);
    cache.release(handle);

    let committed: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));
    let seen = Rc::clone(&committed);
    cache.commit(txn, move |result| *seen.borrow_mut() = Some(result.is_ok()));

    // First cycle fails; the block stays dirty and the commit stays
    // pending.
    serializer.fail_next_writes(1);
    let report = cache.flush().unwrap();
    assert_eq!(report.write_failures, 1);
    assert_eq!(report.retained_dirty, 1);
    assert_eq!(cache.stats().dirty_blocks, 1);
    assert!(committed.borrow().is_none());

    // Second cycle succeeds: block clean, commit complete, bytes on disk.
    let report = cache.flush().unwrap();
    assert_eq!(report.full_writes, 1);
    assert!(report.is_clean());
    assert_eq!(cache.stats().dirty_blocks, 0);
    assert_eq!(*committed.borrow(), Some(true));
    assert_eq!(serializer.block_image(block_id).unwrap(), vec![0xCD; BLOCK_SIZE]);
    cache.shutdown().unwrap();
}

/// Exhausted retries fail the commit with an I/O error kind and leave the
/// dirty bit set.
#[test]
fn writeback_exhaustion_fails_commit() {
    let serializer = SharedSerializer::new();
    let mut cache = cache_over(&serializer, test_config());

    let txn = cache.begin_transaction(AccessMode::Write);
    let handle = cache.allocate(txn).unwrap();
    cache.get_data_major_write(&handle).fill(0xEF);
    cache.release(handle);

    let outcome: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    let seen = Rc::clone(&outcome);
    cache.commit(txn, move |result| {
        *seen.borrow_mut() = Some(match result {
            Ok(()) => "ok".to_string(),
            Err(e) => e.to_string(),
        });
    });

    serializer.fail_next_writes(3);
    cache.flush().unwrap();
    cache.flush().unwrap();
    assert!(outcome.borrow().is_none());
    let report = cache.flush().unwrap();
    assert_eq!(report.write_failures, 1);

    let message = outcome.borrow_mut().take().expect("commit failed");
    assert!(message.contains("Write-back failed"), "got: {message}");
    // The cache stays consistent: the block is still dirty and a later
    // cycle persists it.
    assert_eq!(cache.stats().dirty_blocks, 1);
    let report = cache.flush().unwrap();
    assert!(report.is_clean());
    cache.shutdown().unwrap();
}

/// S6: a memory target that forces eviction never claims a block with a
/// live handle.
#[test]
fn replacement_skips_referenced_blocks() {
    let serializer = SharedSerializer::new();
    // Room for two resident pages.
    let config = CacheConfig {
        target_memory_bytes: 2 * BLOCK_SIZE,
        ..test_config()
    };
    let mut cache = cache_over(&serializer, config);

    let block_a = write_block(&mut cache, 1);
    let block_b = write_block(&mut cache, 2);

    let txn = cache.begin_transaction(AccessMode::Read);
    let held = sync_acquire(&mut cache, txn, block_a, AccessMode::Read);

    // A third block pushes residency over the target; only the unheld
    // clean block may be evicted.
    let block_c = write_block(&mut cache, 3);
    cache.evict_excess();

    assert!(cache.is_resident(block_a), "held block was evicted");
    assert!(cache.stats().resident_bytes <= 2 * BLOCK_SIZE);
    assert!(!cache.is_resident(block_b) || !cache.is_resident(block_c));

    // Evicted blocks reload with their bytes intact.
    let probe = if cache.is_resident(block_b) { block_c } else { block_b };
    let handle = sync_acquire(&mut cache, txn, probe, AccessMode::Read);
    let expected = if probe == block_b { 2u8 } else { 3u8 };
    assert!(cache.buf_data(&handle).iter().all(|&b| b == expected));
    cache.release(handle);

    cache.release(held);
    cache.commit(txn, |r| r.unwrap());
    cache.shutdown().unwrap();
}

/// A snapshot that predates a block's creation cannot read it.
#[test]
fn snapshot_cannot_see_later_allocation() {
    let serializer = SharedSerializer::new();
    let mut cache = cache_over(&serializer, test_config());

    let reader = cache.begin_transaction(AccessMode::Read);
    cache.snapshot(reader);

    let block_id = write_block(&mut cache, 0x42);

    let err = cache
        .acquire(reader, block_id, AccessMode::Read, |_| {})
        .unwrap_err();
    assert!(matches!(
        err,
        NimbusError::SnapshotVersionUnavailable { .. }
    ));

    cache.commit(reader, |r| r.unwrap());
    cache.shutdown().unwrap();
}

/// Patches survive eviction: a block flushed as patches reloads with the
/// patches replayed.
#[test]
fn patched_block_reloads_after_eviction() {
    let serializer = SharedSerializer::new();
    let mut cache = cache_over(&serializer, test_config());
    let block_id = write_block(&mut cache, 0);

    let txn = cache.begin_transaction(AccessMode::Write);
    let handle = sync_acquire(&mut cache, txn, block_id, AccessMode::Write);
    cache.apply_patch(&handle, 10, b"durable").unwrap();
    cache.release(handle);
    commit_and_flush(&mut cache, txn);

    // Reattach a fresh cache so the block must come back through the
    // serializer and the mirrored patch log.
    cache.shutdown().unwrap();
    let mut cache = cache_over(&serializer, test_config());
    let txn = cache.begin_transaction(AccessMode::Read);
    let handle = sync_acquire(&mut cache, txn, block_id, AccessMode::Read);
    assert_eq!(&cache.buf_data(&handle)[10..17], b"durable");
    cache.release(handle);
    cache.commit(txn, |r| r.unwrap());
    cache.shutdown().unwrap();
}
