//! Patch log persistence in the serializer's reserved range.
//!
//! Each flush cycle mirrors the pending in-memory patch log into the
//! blocks directly above the super block, before the data blocks are
//! written. A restart replays the mirrored patches onto loaded blocks,
//! covering the window where a cycle recorded patches but died before the
//! data-block writes completed. Byte-replacement patches replay
//! idempotently, so reapplying already-applied patches is harmless.

use crate::patch_store::PatchMemoryStore;
use bytes::{Buf, BufMut, BytesMut};
use nimbus_common::{BlockId, NimbusError, Patch, Result, SerTxnId};
use nimbus_storage::{Serializer, WritePayload};
use tracing::warn;

/// Byte length prefix at the start of every patch block.
const LEN_PREFIX: usize = 4;

/// The reserved-range mirror of the pending patch log.
pub(crate) struct PatchDiskStorage {
    first_block: BlockId,
    num_blocks: u64,
}

impl PatchDiskStorage {
    /// Default number of reserved patch blocks.
    pub const DEFAULT_NUM_BLOCKS: u64 = 8;

    pub fn new(first_block: BlockId, num_blocks: u64) -> Self {
        debug_assert!(first_block >= BlockId::FIRST_PATCH_BLOCK);
        debug_assert!(num_blocks > 0);
        Self {
            first_block,
            num_blocks,
        }
    }

    /// One past the last reserved block; data blocks start here.
    pub fn end_block(&self) -> BlockId {
        BlockId(self.first_block.0 + self.num_blocks)
    }

    fn payload_capacity(block_size: usize) -> usize {
        block_size.saturating_sub(LEN_PREFIX)
    }

    /// Reads the mirrored patch log, sorted by block and counter.
    pub fn load(&self, ser: &mut dyn Serializer) -> Result<Vec<Patch>> {
        let block_size = ser.block_size();
        let mut image = vec![0u8; block_size];
        let mut patches = Vec::new();

        for i in 0..self.num_blocks {
            let patch_block = BlockId(self.first_block.0 + i);
            if !ser.block_in_use(patch_block) {
                continue;
            }
            ser.read(patch_block, &mut image)?;

            let mut header = &image[..LEN_PREFIX];
            let payload_len = header.get_u32() as usize;
            if payload_len > Self::payload_capacity(block_size) {
                return Err(NimbusError::PatchCorrupted {
                    reason: format!(
                        "patch block {patch_block} claims {payload_len} payload bytes"
                    ),
                });
            }

            let mut payload = &image[LEN_PREFIX..LEN_PREFIX + payload_len];
            while let Some(patch) = Patch::decode(&mut payload)? {
                patches.push(patch);
            }
        }

        patches.sort_by_key(|p| (p.block_id, p.counter));
        Ok(patches)
    }

    /// Mirrors the pending patch log into the reserved range.
    ///
    /// Blocks whose patches do not fit are returned; the caller must force
    /// a full-block flush for them instead. Unused reserved blocks are
    /// rewritten empty so stale mirrors cannot replay.
    pub fn store(
        &self,
        ser: &mut dyn Serializer,
        pending: &PatchMemoryStore,
        txn_id: SerTxnId,
    ) -> Result<Vec<BlockId>> {
        let block_size = ser.block_size();
        let capacity = Self::payload_capacity(block_size);

        // Deterministic packing order.
        let mut groups: Vec<(BlockId, &[Patch])> = pending.blocks().collect();
        groups.sort_by_key(|(block_id, _)| *block_id);
        let mut overflow = Vec::new();

        let mut images: Vec<BytesMut> = vec![BytesMut::new()];
        for (block_id, patches) in groups {
            let group_size: usize = patches.iter().map(Patch::size_on_disk).sum();
            if group_size > capacity {
                overflow.push(block_id);
                continue;
            }
            if images.last().map_or(0, BytesMut::len) + group_size > capacity {
                if images.len() as u64 == self.num_blocks {
                    overflow.push(block_id);
                    continue;
                }
                images.push(BytesMut::new());
            }
            let image = images.last_mut().expect("at least one patch image");
            for patch in patches {
                patch.encode(image);
            }
        }

        if !overflow.is_empty() {
            warn!(
                overflowed = overflow.len(),
                reserved_blocks = self.num_blocks,
                "patch log exceeds reserved range, forcing full flush for overflow"
            );
        }

        for i in 0..self.num_blocks {
            let patch_block = BlockId(self.first_block.0 + i);
            let payload = images.get(i as usize);

            let payload_len = payload.map_or(0, BytesMut::len);
            if payload_len == 0 && !ser.block_in_use(patch_block) {
                // Nothing to mirror and nothing stale to clear.
                continue;
            }

            let mut image = vec![0u8; block_size];
            (&mut image[..LEN_PREFIX]).put_u32(payload_len as u32);
            if let Some(payload) = payload {
                image[LEN_PREFIX..LEN_PREFIX + payload_len].copy_from_slice(payload);
            }

            ser.write(patch_block, WritePayload::Full(&image), txn_id)?;
        }

        Ok(overflow)
    }
}
