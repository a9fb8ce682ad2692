//! Replayable block patches.
//!
//! A patch is a small in-place edit to one block, recorded in lieu of a
//! full-block write. Patches for a block are replayed in `counter` order.

use crate::error::{NimbusError, Result};
use crate::types::{BlockId, PatchCounter};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A single in-place edit to a block.
///
/// Wire format:
/// - block_id: 8 bytes
/// - counter: 4 bytes
/// - offset: 2 bytes
/// - data_len: 2 bytes
/// - data: data_len bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Block this patch applies to.
    pub block_id: BlockId,
    /// Per-block sequence number; patches replay in ascending order.
    pub counter: PatchCounter,
    /// Byte offset of the edit within the block.
    pub offset: u16,
    /// Replacement bytes.
    pub data: Bytes,
}

impl Patch {
    /// Size of the fixed patch header in bytes.
    pub const HEADER_SIZE: usize = 16;

    /// Maximum patch payload size.
    pub const MAX_DATA_SIZE: usize = u16::MAX as usize;

    /// Creates a new patch.
    pub fn new(block_id: BlockId, counter: PatchCounter, offset: u16, data: Bytes) -> Self {
        debug_assert!(data.len() <= Self::MAX_DATA_SIZE);
        Self {
            block_id,
            counter,
            offset,
            data,
        }
    }

    /// Returns the serialized size of this patch.
    pub fn size_on_disk(&self) -> usize {
        Self::HEADER_SIZE + self.data.len()
    }

    /// Applies this patch to a block image.
    pub fn apply(&self, block: &mut [u8]) -> Result<()> {
        let offset = self.offset as usize;
        let end = offset + self.data.len();
        if end > block.len() {
            return Err(NimbusError::PatchOutOfBounds {
                block_id: self.block_id,
                offset,
                len: self.data.len(),
                block_size: block.len(),
            });
        }
        block[offset..end].copy_from_slice(&self.data);
        Ok(())
    }

    /// Serializes this patch into the buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.block_id.0);
        buf.put_u32(self.counter);
        buf.put_u16(self.offset);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
    }

    /// Deserializes one patch from the buffer.
    ///
    /// Returns `Ok(None)` on a clean end of input (empty buffer).
    pub fn decode(buf: &mut impl Buf) -> Result<Option<Patch>> {
        if buf.remaining() == 0 {
            return Ok(None);
        }
        if buf.remaining() < Self::HEADER_SIZE {
            return Err(NimbusError::PatchCorrupted {
                reason: format!("truncated header: {} bytes remaining", buf.remaining()),
            });
        }

        let block_id = BlockId(buf.get_u64());
        let counter = buf.get_u32();
        let offset = buf.get_u16();
        let data_len = buf.get_u16() as usize;

        if buf.remaining() < data_len {
            return Err(NimbusError::PatchCorrupted {
                reason: format!(
                    "truncated payload for {}: need {}, have {}",
                    block_id,
                    data_len,
                    buf.remaining()
                ),
            });
        }

        let data = buf.copy_to_bytes(data_len);
        Ok(Some(Patch {
            block_id,
            counter,
            offset,
            data,
        }))
    }
}
