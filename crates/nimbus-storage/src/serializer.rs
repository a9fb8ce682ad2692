//! The block serializer contract.

use nimbus_common::{BlockId, Patch, Result, SerTxnId};

/// Payload of one serializer write.
#[derive(Debug)]
pub enum WritePayload<'a> {
    /// Replace the whole block image.
    Full(&'a [u8]),
    /// Apply the given patches to the stored block image, in order.
    Patches(&'a [Patch]),
    /// Delete the block. When `write_zero_block` is set the block is
    /// overwritten with zeroes instead of being dropped from the store.
    Delete { write_zero_block: bool },
}

/// Block-oriented storage the buffer cache reads and writes through.
///
/// The serializer owns the on-disk format; the cache only sees fixed-size
/// block images, a monotonic serializer transaction id, and the reserved
/// super block. Implementations are used from the cache's home worker and
/// need not be `Sync`.
pub trait Serializer: Send {
    /// Fixed block size in bytes.
    fn block_size(&self) -> usize;

    /// The super block's id. Patch-disk storage occupies the range
    /// immediately above it.
    fn superblock_id(&self) -> BlockId {
        BlockId::SUPERBLOCK
    }

    /// One past the highest block id ever written.
    fn end_block_id(&self) -> BlockId;

    /// Returns true if the block currently exists in the store.
    fn block_in_use(&self, block_id: BlockId) -> bool;

    /// Reads a block image into `buf`.
    ///
    /// `buf` must be exactly `block_size()` bytes. Fails with
    /// `BlockNotFound` for never-written blocks and `BlockCorrupted` when
    /// the stored image fails verification.
    fn read(&mut self, block_id: BlockId, buf: &mut [u8]) -> Result<()>;

    /// Writes a block under the given serializer transaction id.
    fn write(&mut self, block_id: BlockId, payload: WritePayload<'_>, txn_id: SerTxnId)
        -> Result<()>;

    /// Allocates the next serializer transaction id. Strictly increasing.
    fn allocate_txn_id(&mut self) -> SerTxnId;

    /// Flushes pending writes to stable storage.
    fn sync(&mut self) -> Result<()>;
}
