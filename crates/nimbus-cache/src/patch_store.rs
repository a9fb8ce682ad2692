//! In-memory patch log.

use nimbus_common::{BlockId, Patch, Result};
use std::collections::HashMap;

#[derive(Default)]
struct BlockPatches {
    patches: Vec<Patch>,
    data_size: usize,
}

/// Accumulated not-yet-flushed patches, keyed by block.
///
/// Patches for one block are kept in application order and replayed onto
/// freshly loaded block images. Per-block byte accounting feeds the
/// full-flush-vs-patch-flush decision.
pub(crate) struct PatchMemoryStore {
    blocks: HashMap<BlockId, BlockPatches>,
    total_size: usize,
}

impl PatchMemoryStore {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            total_size: 0,
        }
    }

    /// Records a patch.
    pub fn store(&mut self, patch: Patch) {
        let entry = self.blocks.entry(patch.block_id).or_default();
        debug_assert!(
            entry
                .patches
                .last()
                .map_or(true, |last| last.counter < patch.counter),
            "patch counters must ascend per block"
        );
        entry.data_size += patch.size_on_disk();
        self.total_size += patch.size_on_disk();
        entry.patches.push(patch);
    }

    /// The pending patches for one block, in application order.
    pub fn patches_for(&self, block_id: BlockId) -> Option<&[Patch]> {
        self.blocks.get(&block_id).map(|entry| &entry.patches[..])
    }

    /// Serialized size of the pending patches for one block.
    pub fn block_patch_size(&self, block_id: BlockId) -> usize {
        self.blocks.get(&block_id).map_or(0, |entry| entry.data_size)
    }

    /// Drops every pending patch for `block_id`.
    pub fn drop_block(&mut self, block_id: BlockId) {
        if let Some(entry) = self.blocks.remove(&block_id) {
            self.total_size -= entry.data_size;
        }
    }

    /// Replays this block's pending patches onto a page image.
    pub fn apply_to(&self, block_id: BlockId, data: &mut [u8]) -> Result<()> {
        if let Some(entry) = self.blocks.get(&block_id) {
            for patch in &entry.patches {
                patch.apply(data)?;
            }
        }
        Ok(())
    }

    /// Iterates every block with pending patches.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &[Patch])> {
        self.blocks
            .iter()
            .map(|(&block_id, entry)| (block_id, &entry.patches[..]))
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Serialized size of all pending patches.
    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn patch(block: u64, counter: u32, offset: u16, data: &'static [u8]) -> Patch {
        Patch::new(BlockId(block), counter, offset, Bytes::from_static(data))
    }

    #[test]
    fn test_store_and_lookup() {
        let mut store = PatchMemoryStore::new();
        store.store(patch(1, 0, 0, b"ab"));
        store.store(patch(1, 1, 4, b"cd"));
        store.store(patch(2, 0, 0, b"ef"));

        assert_eq!(store.patches_for(BlockId(1)).unwrap().len(), 2);
        assert_eq!(store.patches_for(BlockId(2)).unwrap().len(), 1);
        assert!(store.patches_for(BlockId(3)).is_none());
    }

    #[test]
    fn test_size_accounting() {
        let mut store = PatchMemoryStore::new();
        assert_eq!(store.total_size(), 0);

        store.store(patch(1, 0, 0, b"abcd"));
        let one = store.total_size();
        assert_eq!(one, Patch::HEADER_SIZE + 4);
        assert_eq!(store.block_patch_size(BlockId(1)), one);

        store.store(patch(2, 0, 0, b"xy"));
        assert_eq!(store.total_size(), one + Patch::HEADER_SIZE + 2);

        store.drop_block(BlockId(1));
        assert_eq!(store.block_patch_size(BlockId(1)), 0);
        assert_eq!(store.total_size(), Patch::HEADER_SIZE + 2);
    }

    #[test]
    fn test_apply_to_replays_in_order() {
        let mut store = PatchMemoryStore::new();
        store.store(patch(1, 0, 0, b"aaaa"));
        store.store(patch(1, 1, 2, b"bb"));

        let mut image = vec![0u8; 8];
        store.apply_to(BlockId(1), &mut image).unwrap();
        assert_eq!(&image[0..4], b"aabb");
    }

    #[test]
    fn test_apply_to_unknown_block_is_noop() {
        let store = PatchMemoryStore::new();
        let mut image = vec![7u8; 8];
        store.apply_to(BlockId(9), &mut image).unwrap();
        assert_eq!(image, vec![7u8; 8]);
    }

    #[test]
    fn test_blocks_iterates_all() {
        let mut store = PatchMemoryStore::new();
        store.store(patch(1, 0, 0, b"a"));
        store.store(patch(5, 0, 0, b"b"));

        let mut blocks: Vec<_> = store
            .blocks()
            .map(|(block_id, patches)| (block_id.0, patches.len()))
            .collect();
        blocks.sort_unstable();
        assert_eq!(blocks, vec![(1, 1), (5, 1)]);
    }
}
