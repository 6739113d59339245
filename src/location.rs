//! Per-handle cache of block location records.
//!
//! Pure bookkeeping: all metadata I/O (fetch-on-miss, full refresh, the
//! last-block-length probe) lives on the handle; this module owns the sorted
//! list, lookup, merging and the consistency cross-check.

use crate::block::{LocatedBlock, LocatedBlocks};

#[derive(Debug, Default)]
pub(crate) struct LocationCache {
    file_id: u64,
    /// Completed blocks, sorted by start offset with no gaps.
    blocks: Vec<LocatedBlock>,
    /// Length of the completed portion.
    completed_length: u64,
    under_construction: bool,
    /// The in-progress last block, if any. `len` holds the probed visible
    /// length, not the nominal size reported by the metadata service.
    last_block: Option<LocatedBlock>,
}

impl LocationCache {
    pub(crate) fn file_id(&self) -> u64 {
        self.file_id
    }

    /// Total readable length: completed portion plus the visible part of an
    /// in-progress last block.
    pub(crate) fn file_length(&self) -> u64 {
        self.completed_length + self.last_block.as_ref().map_or(0, |b| b.len)
    }

    pub(crate) fn under_construction(&self) -> bool {
        self.under_construction
    }

    /// Binary-search the record containing `offset`.
    pub(crate) fn find(&self, offset: u64) -> Option<&LocatedBlock> {
        let idx = self.blocks.partition_point(|b| b.end() <= offset);
        if let Some(b) = self.blocks.get(idx) {
            if b.contains(offset) {
                return Some(b);
            }
        }
        self.last_block.as_ref().filter(|b| b.contains(offset))
    }

    /// Replace the whole cache with a fresh reply. `probed_last_len` is the
    /// visible length of the in-progress last block, when there is one.
    pub(crate) fn install(&mut self, reply: LocatedBlocks, probed_last_len: Option<u64>) {
        let last_block = match (reply.under_construction && !reply.last_block_complete)
            .then_some(reply.last_block)
            .flatten()
        {
            Some(mut last) => {
                if let Some(len) = probed_last_len {
                    last.len = len;
                }
                Some(last)
            }
            None => None,
        };
        *self = Self {
            file_id: reply.file_id,
            blocks: reply.blocks,
            completed_length: reply.file_length,
            under_construction: reply.under_construction,
            last_block,
        };
    }

    /// Merge a range fetch into the cache. Incoming records are
    /// authoritative: any cached record overlapping one is replaced, so
    /// repeated merges of the same reply are idempotent. The in-progress
    /// last block keeps its probed length but takes refreshed servers and
    /// token when the reply carries the same block.
    pub(crate) fn merge_fetched(&mut self, reply: LocatedBlocks) {
        for incoming in reply.blocks {
            let start = self.blocks.partition_point(|b| b.end() <= incoming.offset);
            let mut end = start;
            while end < self.blocks.len() && self.blocks[end].offset < incoming.end() {
                end += 1;
            }
            self.blocks.splice(start..end, [incoming]);
        }
        if let (Some(cached), Some(fresh)) = (&mut self.last_block, reply.last_block) {
            if cached.block.id == fresh.block.id {
                let probed_len = cached.len;
                *cached = fresh;
                cached.len = probed_len;
            }
        }
    }

    /// Cross-check a refresh reply against what this handle has already read
    /// through: the common prefix of both lists must name the same blocks.
    /// A mismatch means the file was mutated concurrently.
    pub(crate) fn consistent_with(&self, reply: &LocatedBlocks) -> bool {
        self.blocks
            .iter()
            .zip(&reply.blocks)
            .all(|(old, new)| old.block == new.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{AccessToken, BlockId};

    fn record(id: u64, offset: u64, len: u64) -> LocatedBlock {
        LocatedBlock {
            block: BlockId { id, generation: 1 },
            offset,
            len,
            servers: Vec::new(),
            token: AccessToken::default(),
            complete: true,
            erasure_coded: false,
        }
    }

    fn cache(blocks: Vec<LocatedBlock>) -> LocationCache {
        let completed_length = blocks.last().map_or(0, LocatedBlock::end);
        let mut cache = LocationCache::default();
        cache.install(
            LocatedBlocks {
                file_id: 1,
                file_length: completed_length,
                blocks,
                under_construction: false,
                last_block: None,
                last_block_complete: true,
            },
            None,
        );
        cache
    }

    #[test]
    fn find_is_exact() {
        let cache = cache(vec![record(1, 0, 100), record(2, 100, 100)]);
        assert_eq!(cache.find(0).unwrap().block.id, 1);
        assert_eq!(cache.find(99).unwrap().block.id, 1);
        assert_eq!(cache.find(100).unwrap().block.id, 2);
        assert_eq!(cache.find(199).unwrap().block.id, 2);
        assert!(cache.find(200).is_none());
    }

    #[test]
    fn merge_replaces_overlapping_records() {
        let mut cache = cache(vec![record(1, 0, 100), record(2, 100, 100)]);
        let mut replacement = record(2, 100, 100);
        replacement.block.generation = 7;
        cache.merge_fetched(LocatedBlocks {
            blocks: vec![replacement.clone()],
            ..LocatedBlocks::default()
        });
        assert_eq!(cache.find(150).unwrap().block.generation, 7);
        // Idempotent: merging the same reply again changes nothing.
        cache.merge_fetched(LocatedBlocks {
            blocks: vec![replacement],
            ..LocatedBlocks::default()
        });
        assert_eq!(cache.file_length(), 200);
        assert_eq!(cache.find(50).unwrap().block.id, 1);
    }

    #[test]
    fn consistency_checks_the_common_prefix() {
        let cache = cache(vec![record(1, 0, 100), record(2, 100, 100)]);
        let same = LocatedBlocks {
            blocks: vec![record(1, 0, 100), record(2, 100, 100), record(3, 200, 100)],
            ..LocatedBlocks::default()
        };
        assert!(cache.consistent_with(&same));
        let changed = LocatedBlocks {
            blocks: vec![record(1, 0, 100), record(9, 100, 100)],
            ..LocatedBlocks::default()
        };
        assert!(!cache.consistent_with(&changed));
    }

    #[test]
    fn under_construction_length_uses_probed_len() {
        let mut cache = LocationCache::default();
        cache.install(
            LocatedBlocks {
                file_id: 1,
                file_length: 200,
                blocks: vec![record(1, 0, 100), record(2, 100, 100)],
                under_construction: true,
                last_block: Some(record(3, 200, 100)),
                last_block_complete: false,
            },
            Some(42),
        );
        assert_eq!(cache.file_length(), 242);
        assert_eq!(cache.find(210).unwrap().block.id, 3);
        assert!(cache.find(242).is_none());
    }
}
