//! In-memory serializer with fault injection.

use crate::serializer::{Serializer, WritePayload};
use nimbus_common::{BlockId, NimbusError, Result, SerTxnId};
use std::collections::{HashMap, HashSet};

/// In-memory block store.
///
/// The reference serializer for unit and scenario tests: block images live
/// in a map, reads and writes are immediate, and targeted faults can be
/// injected to exercise the cache's retry and corruption paths.
pub struct MemSerializer {
    block_size: usize,
    blocks: HashMap<BlockId, Vec<u8>>,
    next_txn_id: u64,
    end_block_id: BlockId,
    /// Number of upcoming writes that fail before writes succeed again.
    fail_next_writes: u32,
    /// Blocks whose reads report corruption.
    poisoned: HashSet<BlockId>,
    full_writes: u64,
    patch_writes: u64,
}

impl MemSerializer {
    /// Creates an empty in-memory serializer with the given block size.
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be nonzero");
        Self {
            block_size,
            blocks: HashMap::new(),
            next_txn_id: 1,
            end_block_id: BlockId::SUPERBLOCK.next(),
            fail_next_writes: 0,
            poisoned: HashSet::new(),
            full_writes: 0,
            patch_writes: 0,
        }
    }

    /// Makes the next `n` writes fail with a serializer error.
    pub fn fail_next_writes(&mut self, n: u32) {
        self.fail_next_writes = n;
    }

    /// Marks a block so reads of it report corruption.
    pub fn poison(&mut self, block_id: BlockId) {
        self.poisoned.insert(block_id);
    }

    /// Number of full-block writes accepted so far.
    pub fn full_writes(&self) -> u64 {
        self.full_writes
    }

    /// Number of patch writes accepted so far.
    pub fn patch_writes(&self) -> u64 {
        self.patch_writes
    }

    /// Returns a copy of the stored image, if any.
    pub fn block_image(&self, block_id: BlockId) -> Option<Vec<u8>> {
        self.blocks.get(&block_id).cloned()
    }

    fn take_write_fault(&mut self) -> Result<()> {
        if self.fail_next_writes > 0 {
            self.fail_next_writes -= 1;
            return Err(NimbusError::Serializer("injected write failure".to_string()));
        }
        Ok(())
    }

    fn note_written(&mut self, block_id: BlockId) {
        if block_id >= self.end_block_id {
            self.end_block_id = block_id.next();
        }
    }
}

impl Serializer for MemSerializer {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn end_block_id(&self) -> BlockId {
        self.end_block_id
    }

    fn block_in_use(&self, block_id: BlockId) -> bool {
        self.blocks.contains_key(&block_id)
    }

    fn read(&mut self, block_id: BlockId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return Err(NimbusError::BlockSizeMismatch {
                expected: self.block_size,
                actual: buf.len(),
            });
        }
        if self.poisoned.contains(&block_id) {
            return Err(NimbusError::BlockCorrupted {
                block_id,
                reason: "injected corruption".to_string(),
            });
        }
        let image = self
            .blocks
            .get(&block_id)
            .ok_or(NimbusError::BlockNotFound { block_id })?;
        buf.copy_from_slice(image);
        Ok(())
    }

    fn write(
        &mut self,
        block_id: BlockId,
        payload: WritePayload<'_>,
        _txn_id: SerTxnId,
    ) -> Result<()> {
        self.take_write_fault()?;

        match payload {
            WritePayload::Full(data) => {
                if data.len() != self.block_size {
                    return Err(NimbusError::BlockSizeMismatch {
                        expected: self.block_size,
                        actual: data.len(),
                    });
                }
                self.blocks.insert(block_id, data.to_vec());
                self.full_writes += 1;
                self.note_written(block_id);
            }
            WritePayload::Patches(patches) => {
                let block_size = self.block_size;
                let image = self
                    .blocks
                    .entry(block_id)
                    .or_insert_with(|| vec![0u8; block_size]);
                for patch in patches {
                    patch.apply(image)?;
                }
                self.patch_writes += 1;
                self.note_written(block_id);
            }
            WritePayload::Delete { write_zero_block } => {
                if write_zero_block {
                    self.blocks.insert(block_id, vec![0u8; self.block_size]);
                    self.note_written(block_id);
                } else {
                    self.blocks.remove(&block_id);
                }
            }
        }
        Ok(())
    }

    fn allocate_txn_id(&mut self) -> SerTxnId {
        let id = SerTxnId(self.next_txn_id);
        self.next_txn_id += 1;
        id
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
