//! Data model shared between the location cache, server selection and the
//! collaborator traits.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Block identity: opaque id plus a generation stamp that changes whenever
/// the block is re-created (e.g. by a recovery pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    pub id: u64,
    pub generation: u64,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}_{}", self.id, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    Memory,
    Ssd,
    #[default]
    Disk,
    Archive,
}

/// One server eligible to serve a block. Constructed fresh each time a
/// server is chosen for an attempt; never cached beyond it.
///
/// `identity` is the server's opaque authorization identity, stable across
/// address changes; `seek_to_new_source` compares identities, not addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCandidate {
    pub addr: ServerAddress,
    pub storage: StorageClass,
    pub identity: String,
}

/// Opaque authorization token for reading one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessToken(pub Bytes);

/// Opaque transfer-encryption key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub key_id: u64,
    pub material: Bytes,
}

/// Readahead / drop-behind hints passed through to each transfer.
/// `None` leaves the server's default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachingStrategy {
    pub readahead: Option<bool>,
    pub drop_behind: Option<bool>,
}

/// Cached location metadata for one block: identity, byte range within the
/// file, and the ordered candidate server list. A record is a cache entry,
/// not ground truth; it may lag the metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedBlock {
    pub block: BlockId,
    /// Start offset of the block within the file.
    pub offset: u64,
    pub len: u64,
    /// Candidates in metadata-assigned priority order.
    pub servers: Vec<ServerCandidate>,
    pub token: AccessToken,
    /// Finalized? Only the last block of a file may be incomplete.
    pub complete: bool,
    /// Erasure-coded blocks are an extension point; hedging skips them.
    pub erasure_coded: bool,
}

impl LocatedBlock {
    /// Exclusive end offset within the file.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.end()
    }

    /// Intersection of this block's range with `[start, end)`, as an
    /// absolute start offset and a length. `None` when disjoint.
    pub fn intersect(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        let s = start.max(self.offset);
        let e = end.min(self.end());
        (s < e).then_some((s, e - s))
    }
}

/// Reply of the metadata service for one location query.
#[derive(Debug, Clone, Default)]
pub struct LocatedBlocks {
    pub file_id: u64,
    /// Length of the completed portion of the file. An in-progress last
    /// block is not included; its visible length is probed separately.
    pub file_length: u64,
    /// Completed blocks, sorted by start offset with no gaps.
    pub blocks: Vec<LocatedBlock>,
    pub under_construction: bool,
    /// The in-progress last block, carried separately from the completed
    /// list. `len` is the nominal size known to the metadata service.
    pub last_block: Option<LocatedBlock>,
    pub last_block_complete: bool,
}

/// One block's corrupt replicas, reported back to the metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptReplicaReport {
    pub block: BlockId,
    pub servers: Vec<ServerAddress>,
}
