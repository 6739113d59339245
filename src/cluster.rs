//! Collaborator contracts: the metadata service and the per-server block
//! transfer capability. Everything behind these traits — wire formats,
//! authentication, the namespace — is out of scope for this crate.

use std::future::Future;
use std::io;
use std::sync::Arc;

use memmap2::Mmap;

use crate::block::{
    AccessToken, BlockId, CachingStrategy, CorruptReplicaReport, EncryptionKey, LocatedBlocks,
    ServerAddress,
};
use crate::error::TransferError;

/// Everything a transfer needs to be opened: constructed fresh per attempt.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub server: ServerAddress,
    pub block: BlockId,
    pub token: AccessToken,
    /// Byte range within the block.
    pub offset: u64,
    pub len: u64,
    pub verify_checksums: bool,
    pub caching: CachingStrategy,
    pub encryption_key: Option<EncryptionKey>,
}

/// The remote side of the read path.
pub trait Cluster: Send + Sync + 'static {
    type Transfer: BlockTransfer;

    /// Resolve `[offset, offset + length)` of `path` to an ordered list of
    /// block location records, plus file length and construction state.
    fn locate_blocks(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> impl Future<Output = io::Result<LocatedBlocks>> + Send;

    /// Best-effort corruption signal back to the metadata service.
    fn report_corrupt_replicas(
        &self,
        path: &str,
        reports: &[CorruptReplicaReport],
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Open the opaque transfer capability against one server.
    fn open_transfer(
        &self,
        spec: TransferSpec,
    ) -> impl Future<Output = Result<Self::Transfer, TransferError>> + Send;

    /// Direct RPC to one server: the visible length of its replica of
    /// `block`. [`TransferError::ReplicaNotFound`] is an expected answer
    /// while a replication pipeline is still being set up.
    fn replica_visible_length(
        &self,
        server: &ServerAddress,
        block: BlockId,
    ) -> impl Future<Output = Result<u64, TransferError>> + Send;

    /// Fetch transfer-encryption key material. Called only after a server
    /// rejects the (possibly absent) cached key.
    fn fetch_encryption_key(
        &self,
    ) -> impl Future<Output = io::Result<Option<EncryptionKey>>> + Send;
}

/// One open transfer of one byte range of one block from one server.
pub trait BlockTransfer: Send {
    /// Pull the next bytes of the requested range into `buf`. Partial reads
    /// are allowed; `Ok(0)` before the range is exhausted means the server
    /// ended the transfer early.
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize, TransferError>> + Send;

    /// All-or-error variant used by positional fetches. A short transfer is
    /// a hard failure for the attempt, not retried against this server.
    fn read_fully(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(), TransferError>> + Send
    where
        Self: Sized,
    {
        async move {
            let expected = buf.len();
            let mut filled = 0;
            while filled < expected {
                match self.read(&mut buf[filled..]).await? {
                    0 => {
                        return Err(TransferError::Truncated {
                            expected,
                            got: filled,
                        })
                    }
                    n => filled += n,
                }
            }
            Ok(())
        }
    }

    /// Whether this transfer is served by a server on the client's host.
    /// Used purely for statistics categorization.
    fn is_local(&self) -> bool;

    /// Whether this transfer bypasses the network entirely (shared memory
    /// or direct file access). Implies `is_local`.
    fn is_short_circuit(&self) -> bool;

    /// A memory-mapped view of the next `len` bytes, when the transfer can
    /// produce one. On success the transfer advances as if `len` bytes were
    /// read. `None` is "not possible", not an error.
    fn mapped_region(&mut self, len: usize) -> Option<MappedRegion>;

    fn close(self) -> impl Future<Output = ()> + Send;
}

/// A read-only window into a memory-mapped replica.
///
/// The map is shared: the region keeps it alive, and the file is unmapped
/// when the last region referencing it is dropped.
#[derive(Debug, Clone)]
pub struct MappedRegion {
    map: Arc<Mmap>,
    offset: usize,
    len: usize,
}

impl MappedRegion {
    /// `None` if `[offset, offset + len)` does not lie within the map.
    pub fn new(map: Arc<Mmap>, offset: usize, len: usize) -> Option<Self> {
        (offset.checked_add(len)? <= map.len()).then_some(Self { map, offset, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
