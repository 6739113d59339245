use std::io;

use thiserror::Error;

use crate::block::BlockId;

/// Failure of one transfer attempt against one server.
///
/// These drive the retry machinery and are classified rather than surfaced:
/// only [`TransferError::Truncated`] escapes to the caller (as
/// [`ReadError::TruncatedTransfer`]); everything else is recovered by
/// failing over to another replica or refreshing a credential.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("access token rejected")]
    InvalidToken,
    #[error("encryption key rejected")]
    InvalidEncryptionKey,
    #[error("replica not found")]
    ReplicaNotFound,
    #[error("transfer truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors surfaced by the public read/seek API.
#[derive(Debug, Error)]
pub enum ReadError {
    /// No block covers the offset, i.e. the offset is at or past end of file.
    #[error("no block covering offset {offset}")]
    NotFound { offset: u64 },
    /// The metadata service returned a block list whose stable prefix does
    /// not match what this handle has already read through. The file was
    /// mutated concurrently and cannot be read safely.
    #[error("block list for {path} has changed")]
    BlocklistChanged { path: String },
    /// A server delivered fewer bytes than requested without an error.
    #[error("transfer truncated: expected {expected} bytes, got {got}")]
    TruncatedTransfer { expected: usize, got: usize },
    /// The metadata service knows of no replica at all for this block.
    #[error("block {block} unavailable: no replica known")]
    BlockUnavailable { block: BlockId },
    /// Every known replica was tried and location refreshes were exhausted.
    #[error("block {block} missing: all replicas exhausted after {attempts} location refreshes")]
    BlockMissing { block: BlockId, attempts: u32 },
    /// No candidate of the file's in-progress last block could report its
    /// current length.
    #[error("cannot determine length of last block {block}")]
    LastBlockLengthUnavailable { block: BlockId },
    #[error("invalid seek to {pos} (file length {len})")]
    InvalidSeek { pos: u64, len: u64 },
    #[error("stream is closed")]
    StreamClosed,
    /// The buffer passed to `release_buffer` was not issued by this handle.
    #[error("buffer was not issued by this handle")]
    UnknownBuffer,
    #[error("end of file reached before reading fully at offset {offset}")]
    UnexpectedEof { offset: u64 },
    #[error("metadata service: {0}")]
    Meta(#[source] io::Error),
}
