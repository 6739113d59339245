//! Read-path client for a replicated block store.
//!
//! Files are stored as fixed-range blocks replicated across storage servers.
//! This crate locates a file's blocks through a metadata service, picks a
//! replica per read, pulls bytes through an opaque per-server transfer
//! capability, and hides partial failures from the caller: stale location
//! metadata is refetched, failed or corrupt replicas are quarantined and
//! failed over, slow replicas can be raced ("hedged reads"), and co-located
//! replicas can be read through memory-mapped views without copying.
//!
//! The entry point is [`FileHandle`], opened against a [`ClientContext`]
//! wrapping an implementation of the [`Cluster`] collaborator trait.
#![deny(clippy::await_holding_lock)]

pub mod block;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod stats;
pub mod zero_copy;

mod hedged;
mod location;
mod select;
mod session;
mod stream;

pub use block::{
    AccessToken, BlockId, CachingStrategy, CorruptReplicaReport, EncryptionKey, LocatedBlock,
    LocatedBlocks, ServerAddress, ServerCandidate, StorageClass,
};
pub use cluster::{BlockTransfer, Cluster, MappedRegion, TransferSpec};
pub use config::Config;
pub use context::ClientContext;
pub use error::{ReadError, TransferError};
pub use handle::FileHandle;
pub use stats::StatsSnapshot;
pub use zero_copy::ZeroCopyBuffer;
