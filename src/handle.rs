//! One open-for-read file.
//!
//! Shared state is split into two lock domains. The `info` mutex guards
//! cacheable metadata (location cache, encryption key, caching strategy)
//! and is taken briefly, never across an await. The `cursor` mutex guards
//! the sequential stream state (position, open transfer session) and is
//! held across transfer I/O. Cursor-domain code may take the info lock;
//! info-domain code never touches the cursor — that ordering is the sole
//! deadlock-avoidance rule. Positional reads touch only the info domain and
//! can run concurrently from many tasks on one handle.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::block::{CachingStrategy, EncryptionKey, LocatedBlock, ServerCandidate};
use crate::cluster::{BlockTransfer, Cluster, TransferSpec};
use crate::context::ClientContext;
use crate::error::{ReadError, TransferError};
use crate::location::LocationCache;
use crate::select::DeadServerTracker;
use crate::stats::{ReadSource, ReadStatistics, StatsSnapshot};
use crate::zero_copy::{BufferRegistry, ZeroCopyBuffer};

/// A file opened for reading. Cheap to clone; all methods take `&self`, and
/// positional reads may be issued concurrently. The sequential cursor is a
/// single logical stream: concurrent `read`/`seek` calls are serialized by
/// the cursor lock but interleave unpredictably — treat it as
/// single-threaded in practice.
pub struct FileHandle<C: Cluster> {
    pub(crate) inner: Arc<Handle<C>>,
}

impl<C: Cluster> Clone for FileHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Cluster> fmt::Debug for FileHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

pub(crate) struct Handle<C: Cluster> {
    pub(crate) ctx: Arc<ClientContext<C>>,
    pub(crate) path: String,
    pub(crate) verify_checksums: bool,
    pub(crate) info: Mutex<FileInfo>,
    /// Serializes refresh cycles (fetch, probe, install) without pinning the
    /// info mutex across the RPCs.
    refresh_lock: tokio::sync::Mutex<()>,
    pub(crate) dead: DeadServerTracker,
    pub(crate) cursor: tokio::sync::Mutex<Cursor<C::Transfer>>,
    pub(crate) stats: ReadStatistics,
    pub(crate) buffers: BufferRegistry,
    closed: AtomicBool,
}

impl<C: Cluster> fmt::Debug for Handle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("verify_checksums", &self.verify_checksums)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct FileInfo {
    pub(crate) locations: LocationCache,
    pub(crate) encryption_key: KeyCache,
    pub(crate) caching: CachingStrategy,
}

#[derive(Debug, Clone)]
pub(crate) enum KeyCache {
    /// A server rejected the cached key; the next attempt refetches.
    Unfetched,
    Cached(Option<EncryptionKey>),
}

/// Sequential stream state, exclusive to the cursor lock holder.
#[derive(Debug)]
pub(crate) struct Cursor<T> {
    pub(crate) pos: u64,
    /// Invariant: when present, the transfer's next byte is at `pos`.
    pub(crate) session: Option<OpenSession<T>>,
}

#[derive(Debug)]
pub(crate) struct OpenSession<T> {
    pub(crate) transfer: T,
    pub(crate) block: LocatedBlock,
    pub(crate) server: ServerCandidate,
    /// Exclusive absolute end offset this session may serve: the block end
    /// clamped to the known file length.
    pub(crate) end: u64,
}

#[derive(Debug, Clone, Copy)]
enum ProbedLength {
    Known(u64),
    /// The block has no candidates to ask yet; retry the refresh later.
    Unknown,
}

impl<C: Cluster> FileHandle<C> {
    /// Open `path` for reading: fetches the initial block list (probing the
    /// visible length of an in-progress last block) and fails if the file
    /// cannot be resolved.
    pub async fn open(
        ctx: Arc<ClientContext<C>>,
        path: impl Into<String>,
    ) -> Result<Self, ReadError> {
        let verify_checksums = ctx.config.verify_checksums;
        let caching = ctx.config.caching;
        let inner = Arc::new(Handle {
            ctx,
            path: path.into(),
            verify_checksums,
            info: Mutex::new(FileInfo {
                locations: LocationCache::default(),
                encryption_key: KeyCache::Cached(None),
                caching,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            dead: DeadServerTracker::default(),
            cursor: tokio::sync::Mutex::new(Cursor {
                pos: 0,
                session: None,
            }),
            stats: ReadStatistics::default(),
            buffers: BufferRegistry::default(),
            closed: AtomicBool::new(false),
        });
        let last_len = inner.refresh_locations().await?;
        tracing::debug!(
            path = %inner.path,
            file_id = inner.file_id(),
            len = inner.file_length(),
            last_block_len = last_len,
            "opened file for read",
        );
        Ok(Self { inner })
    }

    /// Sequential read at the cursor. Returns the number of bytes read,
    /// `0` at end of file. A single call never crosses a block boundary;
    /// callers loop for more.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.inner.read_seq(buf).await
    }

    /// Reposition the cursor. Small forward seeks within the current block
    /// drain the open transfer in place; anything else drops the session
    /// and lets the next `read` reselect a server.
    pub async fn seek(&self, pos: u64) -> Result<(), ReadError> {
        self.inner.seek(pos).await
    }

    /// Like `seek`, but excludes the current server from selection, forcing
    /// failover even if it is healthy. Returns whether a genuinely
    /// different server was obtained (by identity, not address).
    pub async fn seek_to_new_source(&self, pos: u64) -> Result<bool, ReadError> {
        self.inner.seek_to_new_source(pos).await
    }

    /// Positional read: stateless with respect to the cursor and safe to
    /// issue concurrently. Returns the number of bytes read (possibly less
    /// than `buf.len()` at end of file, `0` at or past it). Races a second
    /// replica when hedged reads are enabled.
    pub async fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ReadError> {
        Handle::pread(&self.inner, offset, buf).await
    }

    /// Positional read of exactly `buf.len()` bytes.
    pub async fn read_fully(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        let mut filled = 0;
        while filled < buf.len() {
            match Handle::pread(&self.inner, offset + filled as u64, &mut buf[filled..]).await? {
                0 => {
                    return Err(ReadError::UnexpectedEof {
                        offset: offset + filled as u64,
                    })
                }
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Read at the cursor into a hand-out buffer: a memory-mapped view when
    /// short-circuit access allows it, otherwise a pooled copy. `None` at
    /// end of file. Return the buffer via [`Self::release_buffer`].
    pub async fn read_buffer(&self, max_len: usize) -> Result<Option<ZeroCopyBuffer>, ReadError> {
        self.inner.read_buffer(max_len).await
    }

    /// Release a buffer obtained from [`Self::read_buffer`]. Fails with
    /// [`ReadError::UnknownBuffer`] for buffers this handle never issued.
    pub fn release_buffer(&self, buf: ZeroCopyBuffer) -> Result<(), ReadError> {
        self.inner.buffers.release(buf)
    }

    pub async fn position(&self) -> u64 {
        self.inner.cursor.lock().await.pos
    }

    /// Bytes remaining between the cursor and end of file.
    pub async fn available(&self) -> u64 {
        let pos = self.inner.cursor.lock().await.pos;
        self.inner.file_length().saturating_sub(pos)
    }

    pub fn file_length(&self) -> u64 {
        self.inner.file_length()
    }

    pub fn file_id(&self) -> u64 {
        self.inner.file_id()
    }

    /// Whether the file's last block was still being written at the most
    /// recent location refresh.
    pub fn is_under_construction(&self) -> bool {
        self.inner.info.lock().locations.under_construction()
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.inner.stats.reset();
    }

    /// Update the readahead / drop-behind hints applied to subsequent
    /// transfers.
    pub fn set_caching_strategy(&self, readahead: Option<bool>, drop_behind: Option<bool>) {
        self.inner.info.lock().caching = CachingStrategy {
            readahead,
            drop_behind,
        };
    }

    /// Close the handle and release the open transfer session. Idempotent;
    /// any still-outstanding zero-copy buffers are reported but do not
    /// block the close.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl<C: Cluster> Handle<C> {
    pub(crate) fn ensure_readable(&self) -> Result<(), ReadError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReadError::StreamClosed);
        }
        Ok(())
    }

    pub(crate) fn file_length(&self) -> u64 {
        self.info.lock().locations.file_length()
    }

    pub(crate) fn file_id(&self) -> u64 {
        self.info.lock().locations.file_id()
    }

    /// Re-fetch the full block list, cross-checking that the stable prefix
    /// is unchanged, and determine the visible length of an in-progress
    /// last block by asking its candidate servers directly. Returns that
    /// length (0 for a finalized file).
    pub(crate) async fn refresh_locations(&self) -> Result<u64, ReadError> {
        let _refresh = self.refresh_lock.lock().await;
        let config = &self.ctx.config;
        let mut attempt = 0;
        loop {
            let reply = self
                .ctx
                .cluster()
                .locate_blocks(&self.path, 0, config.locate_prefetch)
                .await
                .map_err(ReadError::Meta)?;
            if !self.info.lock().locations.consistent_with(&reply) {
                return Err(ReadError::BlocklistChanged {
                    path: self.path.clone(),
                });
            }
            let last_in_progress = reply.under_construction && !reply.last_block_complete;
            let probed = match (last_in_progress, &reply.last_block) {
                (true, Some(last)) => match self.probe_last_block_length(last).await? {
                    ProbedLength::Known(len) => Some(len),
                    ProbedLength::Unknown => {
                        attempt += 1;
                        if attempt >= config.last_block_probe_retries {
                            tracing::warn!(
                                path = %self.path,
                                block = %last.block,
                                "last block locations still unavailable, giving up",
                            );
                            return Err(ReadError::LastBlockLengthUnavailable { block: last.block });
                        }
                        tracing::warn!(
                            path = %self.path,
                            attempt,
                            "last block length unavailable, will re-fetch locations",
                        );
                        tokio::time::sleep(config.last_block_probe_retry_delay()).await;
                        continue;
                    }
                },
                _ => None,
            };
            let last_len = probed.unwrap_or(0);
            self.info.lock().locations.install(reply, probed);
            return Ok(last_len);
        }
    }

    /// Ask each candidate of the (possibly open) last block, in listed
    /// order, for its replica's visible length. "Replica not found" is
    /// expected while a pipeline is mid-setup and only skips that
    /// candidate; every candidate answering so means no data has been
    /// written yet.
    async fn probe_last_block_length(
        &self,
        last: &LocatedBlock,
    ) -> Result<ProbedLength, ReadError> {
        if last.servers.is_empty() {
            return Ok(if last.len == 0 {
                ProbedLength::Known(0)
            } else {
                ProbedLength::Unknown
            });
        }
        let mut not_found = 0;
        for candidate in &last.servers {
            match self
                .ctx
                .cluster()
                .replica_visible_length(&candidate.addr, last.block)
                .await
            {
                Ok(len) => return Ok(ProbedLength::Known(len)),
                Err(TransferError::ReplicaNotFound) => {
                    tracing::debug!(
                        block = %last.block,
                        server = %candidate.addr,
                        "replica not created yet",
                    );
                    not_found += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        block = %last.block,
                        server = %candidate.addr,
                        %err,
                        "failed to probe replica length",
                    );
                }
            }
        }
        if not_found == last.servers.len() {
            Ok(ProbedLength::Known(0))
        } else {
            Err(ReadError::LastBlockLengthUnavailable { block: last.block })
        }
    }

    /// The cached record containing `offset`, fetching a fresh range from
    /// the metadata service on a miss.
    pub(crate) async fn resolve_block(&self, offset: u64) -> Result<LocatedBlock, ReadError> {
        {
            let info = self.info.lock();
            if offset >= info.locations.file_length() {
                return Err(ReadError::NotFound { offset });
            }
            if let Some(record) = info.locations.find(offset) {
                return Ok(record.clone());
            }
        }
        self.resolve_block_fresh(offset).await
    }

    /// Fetch the record containing `offset` from the metadata service,
    /// bypassing the cache (used to refresh a rejected access token), and
    /// merge the reply in.
    pub(crate) async fn resolve_block_fresh(&self, offset: u64) -> Result<LocatedBlock, ReadError> {
        let reply = self
            .ctx
            .cluster()
            .locate_blocks(&self.path, offset, self.ctx.config.locate_prefetch)
            .await
            .map_err(ReadError::Meta)?;
        let mut info = self.info.lock();
        info.locations.merge_fetched(reply);
        info.locations
            .find(offset)
            .cloned()
            .ok_or(ReadError::NotFound { offset })
    }

    /// Records covering `[offset, offset + len)`, fetching missing ranges
    /// as needed. The first record contains `offset`; an in-progress last
    /// block shows up as its own trailing record.
    pub(crate) async fn resolve_range(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<Vec<LocatedBlock>, ReadError> {
        let end = offset + len;
        let mut records = Vec::new();
        let mut cur = offset;
        while cur < end {
            let record = self.resolve_block(cur).await?;
            if record.end() <= cur {
                break;
            }
            cur = record.end();
            records.push(record);
        }
        Ok(records)
    }

    pub(crate) async fn current_encryption_key(
        &self,
    ) -> io::Result<Option<EncryptionKey>> {
        if let KeyCache::Cached(key) = &self.info.lock().encryption_key {
            return Ok(key.clone());
        }
        let key = self.ctx.cluster().fetch_encryption_key().await?;
        self.info.lock().encryption_key = KeyCache::Cached(key.clone());
        Ok(key)
    }

    pub(crate) fn clear_encryption_key(&self) {
        self.info.lock().encryption_key = KeyCache::Unfetched;
    }

    pub(crate) fn transfer_spec(
        &self,
        record: &LocatedBlock,
        server: &ServerCandidate,
        offset_in_block: u64,
        len: u64,
        encryption_key: Option<EncryptionKey>,
    ) -> TransferSpec {
        TransferSpec {
            server: server.addr.clone(),
            block: record.block,
            token: record.token.clone(),
            offset: offset_in_block,
            len,
            verify_checksums: self.verify_checksums,
            caching: self.info.lock().caching,
            encryption_key,
        }
    }

    pub(crate) fn record_transfer_stats(
        &self,
        transfer: &C::Transfer,
        server: &ServerCandidate,
        bytes: u64,
    ) {
        let source = if transfer.is_short_circuit() {
            ReadSource::ShortCircuit
        } else if transfer.is_local() || self.ctx.is_local_address(&server.addr) {
            ReadSource::Local
        } else {
            ReadSource::Remote
        };
        self.stats.record(source, bytes);
    }

    /// Wait before the next refresh-and-retry cycle. The wait grows
    /// linearly with consecutive failures plus a jitter factor, bounding
    /// retry storms against a struggling metadata service.
    pub(crate) async fn acquire_backoff(&self, failures: u32) {
        let window = self.ctx.config.retry_window_ms;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wait = window * u64::from(failures)
            + (window as f64 * f64::from(failures + 1) * rand::random::<f64>()) as u64;
        tracing::debug!(failures, wait_ms = wait, "waiting before refreshing locations");
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let session = self.cursor.lock().await.session.take();
        if let Some(session) = session {
            session.transfer.close().await;
        }
        let outstanding = self.buffers.outstanding();
        if outstanding != 0 {
            tracing::warn!(
                path = %self.path,
                outstanding,
                "zero-copy buffers still outstanding at close",
            );
        }
        tracing::debug!(path = %self.path, "closed reader");
    }
}

impl<C: Cluster> Drop for Handle<C> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            tracing::warn!(path = %self.path, "reader dropped without close");
        }
    }
}
