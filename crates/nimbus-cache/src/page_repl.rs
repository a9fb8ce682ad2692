//! Randomized sampling page replacement.

use crate::buf::InnerBuf;
use crate::page_map::{BufSlot, PageMap};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Eviction policy: sample a handful of resident buffers and evict the
/// least recently touched one that is safe to unload.
///
/// Sampling keeps the policy O(K) per eviction with no per-access
/// bookkeeping; the cache records a logical access clock on each acquire
/// and the policy compares those timestamps.
pub(crate) struct PageRepl {
    sample_size: usize,
    rng: SmallRng,
}

impl PageRepl {
    pub fn new(sample_size: usize) -> Self {
        assert!(sample_size > 0);
        Self {
            sample_size,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Picks an eviction victim, or None when no sampled buffer is safe.
    ///
    /// Buffers with live handles, dirty state, preserved snapshots, or an
    /// active flush never qualify: `is_safe` must reject them.
    pub fn pick_victim(
        &mut self,
        map: &PageMap,
        is_safe: impl Fn(&InnerBuf) -> bool,
    ) -> Option<BufSlot> {
        let range = map.slot_range();
        if range == 0 {
            return None;
        }

        let mut victim: Option<(BufSlot, u64)> = None;
        for _ in 0..self.sample_size {
            let index = self.rng.gen_range(0..range);
            let Some(buf) = map.buf_at(index) else {
                continue;
            };
            if !is_safe(buf) {
                continue;
            }
            let better = victim.map_or(true, |(_, recency)| buf.subtree_recency < recency);
            if better {
                victim = Some((BufSlot(index), buf.subtree_recency));
            }
        }
        victim.map(|(slot, _)| slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::{BlockId, VersionId};

    fn resident_map(blocks: u64) -> PageMap {
        let mut map = PageMap::new();
        for i in 0..blocks {
            let mut buf = InnerBuf::new(BlockId(10 + i), vec![0u8; 16].into(), VersionId::NULL);
            buf.subtree_recency = i;
            map.insert(buf);
        }
        map
    }

    #[test]
    fn test_empty_map_has_no_victim() {
        let map = PageMap::new();
        let mut repl = PageRepl::new(4);
        assert!(repl.pick_victim(&map, |_| true).is_none());
    }

    #[test]
    fn test_unsafe_buffers_never_selected() {
        let map = resident_map(8);
        let mut repl = PageRepl::new(64);

        // Everything except block 13 is unsafe.
        for _ in 0..32 {
            let victim = repl.pick_victim(&map, |buf| buf.block_id == BlockId(13));
            if let Some(slot) = victim {
                assert_eq!(map.buf(slot).block_id, BlockId(13));
            }
        }
    }

    #[test]
    fn test_all_unsafe_yields_none() {
        let map = resident_map(8);
        let mut repl = PageRepl::new(64);
        assert!(repl.pick_victim(&map, |_| false).is_none());
    }

    #[test]
    fn test_prefers_older_recency() {
        let map = resident_map(16);
        // Sampling the whole set repeatedly must pick the oldest buffer.
        let mut repl = PageRepl::new(256);
        let victim = repl.pick_victim(&map, |_| true).unwrap();
        assert_eq!(map.buf(victim).subtree_recency, 0);
    }
}
