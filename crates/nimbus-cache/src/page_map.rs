//! Mapping from block id to resident buffer.

use crate::buf::InnerBuf;
use nimbus_common::BlockId;
use std::collections::HashMap;

/// Stable index of one resident buffer.
///
/// Slots are reused only after their buffer is disposed, so sibling
/// components can hold a slot across operations while the buffer stays
/// resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufSlot(pub(crate) usize);

/// Owns every resident buffer and the block-id index over them.
pub(crate) struct PageMap {
    slots: Vec<Option<InnerBuf>>,
    free_slots: Vec<usize>,
    index: HashMap<BlockId, BufSlot>,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Number of indexed resident blocks.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Upper bound on slot indices, for sampling.
    pub fn slot_range(&self) -> usize {
        self.slots.len()
    }

    /// Looks up the slot holding `block_id`.
    pub fn get(&self, block_id: BlockId) -> Option<BufSlot> {
        self.index.get(&block_id).copied()
    }

    /// Inserts a buffer, indexing it under its block id.
    pub fn insert(&mut self, buf: InnerBuf) -> BufSlot {
        debug_assert!(
            !self.index.contains_key(&buf.block_id),
            "{} is already resident",
            buf.block_id
        );
        let block_id = buf.block_id;
        let slot = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index] = Some(buf);
                BufSlot(index)
            }
            None => {
                self.slots.push(Some(buf));
                BufSlot(self.slots.len() - 1)
            }
        };
        self.index.insert(block_id, slot);
        slot
    }

    pub fn buf(&self, slot: BufSlot) -> &InnerBuf {
        self.slots[slot.0].as_ref().expect("stale buffer slot")
    }

    pub fn buf_mut(&mut self, slot: BufSlot) -> &mut InnerBuf {
        self.slots[slot.0].as_mut().expect("stale buffer slot")
    }

    /// The buffer at a raw sample index, if the slot is occupied.
    pub fn buf_at(&self, index: usize) -> Option<&InnerBuf> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Removes `block_id` from the index while keeping the slot alive.
    ///
    /// Used for deleted blocks whose snapshot images are still owned; the
    /// slot is disposed once the last owner releases.
    pub fn unindex(&mut self, block_id: BlockId) {
        self.index.remove(&block_id);
    }

    /// Disposes the buffer in `slot`, freeing the slot for reuse.
    pub fn dispose(&mut self, slot: BufSlot) -> InnerBuf {
        let buf = self.slots[slot.0].take().expect("double dispose of slot");
        self.index.remove(&buf.block_id);
        self.free_slots.push(slot.0);
        buf
    }

    /// Visits every resident buffer's slot.
    pub fn for_each_slot(&self, mut f: impl FnMut(BufSlot, &InnerBuf)) {
        for (index, entry) in self.slots.iter().enumerate() {
            if let Some(buf) = entry {
                f(BufSlot(index), buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::VersionId;

    fn buf(block: u64) -> InnerBuf {
        InnerBuf::new(BlockId(block), vec![0u8; 16].into(), VersionId::NULL)
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut map = PageMap::new();
        let slot = map.insert(buf(5));

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(BlockId(5)), Some(slot));
        assert_eq!(map.buf(slot).block_id, BlockId(5));
        assert!(map.get(BlockId(6)).is_none());
    }

    #[test]
    fn test_dispose_frees_slot_for_reuse() {
        let mut map = PageMap::new();
        let slot_a = map.insert(buf(1));
        map.insert(buf(2));

        let removed = map.dispose(slot_a);
        assert_eq!(removed.block_id, BlockId(1));
        assert!(map.get(BlockId(1)).is_none());
        assert_eq!(map.len(), 1);

        // The freed slot is recycled.
        let slot_c = map.insert(buf(3));
        assert_eq!(slot_c, slot_a);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_unindex_keeps_slot_alive() {
        let mut map = PageMap::new();
        let slot = map.insert(buf(7));

        map.unindex(BlockId(7));
        assert!(map.get(BlockId(7)).is_none());
        assert_eq!(map.buf(slot).block_id, BlockId(7));
    }

    #[test]
    fn test_for_each_slot_skips_holes() {
        let mut map = PageMap::new();
        let slot_a = map.insert(buf(1));
        map.insert(buf(2));
        map.insert(buf(3));
        map.dispose(slot_a);

        let mut seen = Vec::new();
        map.for_each_slot(|_slot, b| seen.push(b.block_id.0));
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 3]);
    }
}
