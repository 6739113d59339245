//! Positional block fetches: the single-attempt state machine, the bounded
//! outer retry loop and corruption reporting.
//!
//! An attempt opens the transfer capability against one chosen server and
//! reads the whole range. Credential problems (rejected encryption key or
//! access token) are repaired once within the attempt; everything else
//! fails the attempt and the outer loop moves to another server, falling
//! back to a backoff-plus-metadata-refresh cycle once every known candidate
//! has been tried.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::block::{BlockId, CorruptReplicaReport, LocatedBlock, ServerAddress, ServerCandidate};
use crate::cluster::{BlockTransfer, Cluster};
use crate::error::{ReadError, TransferError};
use crate::handle::Handle;
use crate::select::choose_server;

/// Outcome classification for one failed attempt.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Data-integrity failure: quarantine the server and move on, never
    /// retry it within the attempt.
    Checksum,
    /// Protocol violation surfaced to the caller immediately.
    Fatal(ReadError),
    /// Server-level failure: quarantine and fail over.
    Failed(TransferError),
}

/// Corrupt (block, server) pairs found during one logical operation,
/// reported once when it completes. Reports are suppressed when every
/// replica of a multi-replica block looks corrupt — a client that cannot
/// read anything reliably is the likelier culprit.
#[derive(Debug, Default)]
pub(crate) struct CorruptTracker {
    by_block: HashMap<BlockId, CorruptEntry>,
}

#[derive(Debug)]
struct CorruptEntry {
    replicas: usize,
    servers: Vec<ServerAddress>,
}

impl CorruptTracker {
    pub(crate) fn add(&mut self, record: &LocatedBlock, server: &ServerAddress) {
        let entry = self
            .by_block
            .entry(record.block)
            .or_insert_with(|| CorruptEntry {
                replicas: record.servers.len(),
                servers: Vec::new(),
            });
        if !entry.servers.contains(server) {
            entry.servers.push(server.clone());
        }
    }

    fn into_reports(self) -> Vec<CorruptReplicaReport> {
        self.by_block
            .into_iter()
            .filter(|(_, entry)| entry.servers.len() < entry.replicas || entry.replicas == 1)
            .map(|(block, entry)| CorruptReplicaReport {
                block,
                servers: entry.servers,
            })
            .collect()
    }
}

impl<C: Cluster> Handle<C> {
    /// Positional read entry point. See [`crate::FileHandle::pread`].
    pub(crate) async fn pread(
        this: &Arc<Self>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ReadError> {
        this.ensure_readable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let file_len = this.file_length();
        if offset >= file_len {
            return Ok(0);
        }
        let end = file_len.min(offset + buf.len() as u64);
        let records = this.resolve_range(offset, end - offset).await?;
        let mut filled = 0usize;
        for record in records {
            let (start, span) = record
                .intersect(offset, end)
                .expect("resolved record covers the requested range");
            let span = usize::try_from(span).expect("span bounded by buf.len()");
            let target = &mut buf[filled..filled + span];
            if this.ctx.config.hedged_reads && !record.erasure_coded && record.servers.len() > 1 {
                Self::hedged_fetch_block_range(this, start, target).await?;
            } else {
                this.fetch_block_range(start, target).await?;
            }
            filled += span;
        }
        Ok(filled)
    }

    /// Fetch `[abs_start, abs_start + target.len())` of the block containing
    /// `abs_start`, retrying across replicas and metadata refreshes.
    pub(crate) async fn fetch_block_range(
        &self,
        abs_start: u64,
        target: &mut [u8],
    ) -> Result<(), ReadError> {
        let mut corrupt = CorruptTracker::default();
        let result = self
            .fetch_block_range_inner(abs_start, target, &mut corrupt)
            .await;
        self.report_corruption(corrupt).await;
        result
    }

    async fn fetch_block_range_inner(
        &self,
        abs_start: u64,
        target: &mut [u8],
        corrupt: &mut CorruptTracker,
    ) -> Result<(), ReadError> {
        let mut ignore: HashSet<ServerAddress> = HashSet::new();
        let mut failures = 0u32;
        loop {
            // The record may have changed since the last attempt: another
            // reader on the handle can have refreshed the cache.
            let record = self.resolve_block(abs_start).await?;
            let Some(server) = choose_server(&record, &self.dead, &ignore) else {
                self.exhausted_candidates(&record, &mut failures, Some(&mut ignore))
                    .await?;
                continue;
            };
            let offset_in_block = abs_start - record.offset;
            match self
                .fetch_attempt(&record, &server, offset_in_block, target)
                .await
            {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Checksum) => {
                    tracing::warn!(
                        block = %record.block,
                        server = %server.addr,
                        "checksum mismatch, quarantining replica",
                    );
                    corrupt.add(&record, &server.addr);
                    self.dead.mark_dead(&server.addr);
                    ignore.insert(server.addr);
                }
                Err(AttemptError::Failed(err)) => {
                    tracing::warn!(
                        block = %record.block,
                        server = %server.addr,
                        %err,
                        "read attempt failed",
                    );
                    self.dead.mark_dead(&server.addr);
                    ignore.insert(server.addr);
                }
            }
        }
    }

    /// One attempt: open the capability against `server` and read the whole
    /// range. A rejected encryption key or access token is repaired and
    /// retried once each within the attempt.
    pub(crate) async fn fetch_attempt(
        &self,
        record: &LocatedBlock,
        server: &ServerCandidate,
        offset_in_block: u64,
        target: &mut [u8],
    ) -> Result<(), AttemptError> {
        let mut record = record.clone();
        let mut key_retried = false;
        let mut token_retried = false;
        loop {
            let key = self
                .current_encryption_key()
                .await
                .map_err(|err| AttemptError::Failed(TransferError::Io(err)))?;
            let spec =
                self.transfer_spec(&record, server, offset_in_block, target.len() as u64, key);
            let attempt = async {
                let mut transfer = self.ctx.cluster().open_transfer(spec).await?;
                transfer.read_fully(&mut *target).await?;
                Ok::<_, TransferError>(transfer)
            };
            match attempt.await {
                Ok(transfer) => {
                    self.record_transfer_stats(&transfer, server, target.len() as u64);
                    transfer.close().await;
                    return Ok(());
                }
                Err(TransferError::ChecksumMismatch) => return Err(AttemptError::Checksum),
                Err(TransferError::InvalidEncryptionKey) if !key_retried => {
                    key_retried = true;
                    tracing::debug!(
                        server = %server.addr,
                        "encryption key rejected, refetching",
                    );
                    self.clear_encryption_key();
                }
                Err(TransferError::InvalidToken) if !token_retried => {
                    token_retried = true;
                    tracing::debug!(
                        block = %record.block,
                        "access token rejected, refreshing location",
                    );
                    record = self
                        .resolve_block_fresh(record.offset)
                        .await
                        .map_err(AttemptError::Fatal)?;
                }
                Err(TransferError::Truncated { expected, got }) => {
                    return Err(AttemptError::Fatal(ReadError::TruncatedTransfer {
                        expected,
                        got,
                    }))
                }
                Err(err) => return Err(AttemptError::Failed(err)),
            }
        }
    }

    /// Every known candidate has been tried: back off, clear the quarantine
    /// (locations themselves may have changed, so quarantined servers get
    /// another chance), force a metadata refresh, and count the cycle
    /// against the per-operation bound.
    pub(crate) async fn exhausted_candidates(
        &self,
        record: &LocatedBlock,
        failures: &mut u32,
        ignore: Option<&mut HashSet<ServerAddress>>,
    ) -> Result<(), ReadError> {
        if *failures >= self.ctx.config.max_block_acquire_failures {
            tracing::warn!(
                block = %record.block,
                failures = *failures,
                "out of usable replicas",
            );
            return Err(if record.servers.is_empty() {
                ReadError::BlockUnavailable {
                    block: record.block,
                }
            } else {
                ReadError::BlockMissing {
                    block: record.block,
                    attempts: *failures,
                }
            });
        }
        self.acquire_backoff(*failures).await;
        *failures += 1;
        self.dead.clear_all();
        if let Some(ignore) = ignore {
            ignore.clear();
        }
        self.refresh_locations().await?;
        Ok(())
    }

    /// Best-effort corruption report, once per logical operation.
    pub(crate) async fn report_corruption(&self, corrupt: CorruptTracker) {
        let reports = corrupt.into_reports();
        if reports.is_empty() {
            return;
        }
        if let Err(err) = self
            .ctx
            .cluster()
            .report_corrupt_replicas(&self.path, &reports)
            .await
        {
            tracing::warn!(path = %self.path, %err, "failed to report corrupt replicas");
        }
    }
}
