//! The sequential (stateful) read engine.
//!
//! One logical cursor per handle: a position, the current block boundary
//! and an open transfer session. Reads clamp to the current block and
//! reopen a session on boundary crossings or after seeks. On a transfer
//! failure the engine retries the same server once per read call — an
//! idle-connection close is indistinguishable from a real fault and is the
//! common case — before quarantining it and failing over; a checksum
//! mismatch quarantines immediately.

use std::collections::HashSet;
use std::io;

use crate::block::{LocatedBlock, ServerAddress, ServerCandidate};
use crate::cluster::{BlockTransfer, Cluster};
use crate::error::{ReadError, TransferError};
use crate::handle::{Cursor, Handle, OpenSession};
use crate::select::choose_server;
use crate::session::CorruptTracker;

enum SeqOutcome {
    Read(usize),
    Checksum,
    Failed(TransferError),
}

impl<C: Cluster> Handle<C> {
    pub(crate) async fn read_seq(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.ensure_readable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut cursor = self.cursor.lock().await;
        let mut corrupt = CorruptTracker::default();
        let result = self.read_seq_inner(&mut cursor, buf, &mut corrupt).await;
        drop(cursor);
        self.report_corruption(corrupt).await;
        result
    }

    /// One sequential read: at most one block's worth of bytes, retried
    /// across replicas until something is read, EOF, or the bounded refresh
    /// policy gives up.
    pub(crate) async fn read_seq_inner(
        &self,
        cursor: &mut Cursor<C::Transfer>,
        buf: &mut [u8],
        corrupt: &mut CorruptTracker,
    ) -> Result<usize, ReadError> {
        let mut failures = 0u32;
        let mut retry_current = true;
        loop {
            if !self.ensure_session(cursor, &mut failures).await? {
                return Ok(0);
            }
            let outcome = {
                let sess = cursor.session.as_mut().expect("session was just ensured");
                let n = usize::try_from(sess.end - cursor.pos)
                    .unwrap_or(usize::MAX)
                    .min(buf.len());
                match sess.transfer.read(&mut buf[..n]).await {
                    Ok(0) => SeqOutcome::Failed(TransferError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "transfer ended before block end",
                    ))),
                    Ok(read) => {
                        self.record_transfer_stats(&sess.transfer, &sess.server, read as u64);
                        SeqOutcome::Read(read)
                    }
                    Err(TransferError::ChecksumMismatch) => SeqOutcome::Checksum,
                    Err(err) => SeqOutcome::Failed(err),
                }
            };
            match outcome {
                SeqOutcome::Read(read) => {
                    cursor.pos += read as u64;
                    return Ok(read);
                }
                SeqOutcome::Checksum => {
                    let sess = cursor.session.take().expect("session was just ensured");
                    tracing::warn!(
                        block = %sess.block.block,
                        server = %sess.server.addr,
                        "checksum mismatch, failing over",
                    );
                    corrupt.add(&sess.block, &sess.server.addr);
                    self.dead.mark_dead(&sess.server.addr);
                    sess.transfer.close().await;
                }
                SeqOutcome::Failed(err) => {
                    let sess = cursor.session.take().expect("session was just ensured");
                    if retry_current {
                        retry_current = false;
                        tracing::warn!(
                            server = %sess.server.addr,
                            %err,
                            "transfer failed, retrying the same server",
                        );
                        let (record, server) = (sess.block.clone(), sess.server.clone());
                        sess.transfer.close().await;
                        match self.open_session(&record, &server, cursor.pos).await {
                            Ok(reopened) => cursor.session = Some(reopened),
                            Err(reopen_err) => {
                                tracing::warn!(
                                    server = %server.addr,
                                    err = %reopen_err,
                                    "reopen failed, quarantining",
                                );
                                self.dead.mark_dead(&server.addr);
                            }
                        }
                    } else {
                        tracing::warn!(
                            server = %sess.server.addr,
                            %err,
                            "transfer failed again, quarantining",
                        );
                        self.dead.mark_dead(&sess.server.addr);
                        sess.transfer.close().await;
                    }
                }
            }
        }
    }

    /// Make sure an open session covers the cursor, opening one if needed.
    /// `Ok(false)` at end of file.
    pub(crate) async fn ensure_session(
        &self,
        cursor: &mut Cursor<C::Transfer>,
        failures: &mut u32,
    ) -> Result<bool, ReadError> {
        if cursor.pos >= self.file_length() {
            return Ok(false);
        }
        if let Some(sess) = &cursor.session {
            if cursor.pos < sess.end {
                return Ok(true);
            }
        }
        if let Some(sess) = cursor.session.take() {
            sess.transfer.close().await;
        }
        let sess = self
            .open_session_at(cursor.pos, &HashSet::new(), failures)
            .await?;
        cursor.session = Some(sess);
        Ok(true)
    }

    /// Select a server for the block at `pos` and open a transfer session
    /// against it, escalating to backoff-and-refresh when candidates run
    /// out. `exclude` holds addresses to avoid beyond the quarantine set.
    pub(crate) async fn open_session_at(
        &self,
        pos: u64,
        exclude: &HashSet<ServerAddress>,
        failures: &mut u32,
    ) -> Result<OpenSession<C::Transfer>, ReadError> {
        let mut key_retried = false;
        let mut token_retried = false;
        loop {
            let record = self.resolve_block(pos).await?;
            let Some(server) = choose_server(&record, &self.dead, exclude) else {
                self.exhausted_candidates(&record, failures, None).await?;
                continue;
            };
            match self.open_session(&record, &server, pos).await {
                Ok(sess) => {
                    tracing::debug!(
                        block = %record.block,
                        server = %server.addr,
                        pos,
                        "opened block session",
                    );
                    return Ok(sess);
                }
                Err(TransferError::InvalidEncryptionKey) if !key_retried => {
                    key_retried = true;
                    tracing::debug!(server = %server.addr, "encryption key rejected, refetching");
                    self.clear_encryption_key();
                }
                Err(TransferError::InvalidToken) if !token_retried => {
                    token_retried = true;
                    tracing::debug!(block = %record.block, "access token rejected, refreshing");
                    self.resolve_block_fresh(pos).await?;
                }
                Err(err) => {
                    tracing::warn!(
                        block = %record.block,
                        server = %server.addr,
                        %err,
                        "failed to open transfer",
                    );
                    self.dead.mark_dead(&server.addr);
                }
            }
        }
    }

    /// Open a transfer for the rest of the block starting at `pos`.
    async fn open_session(
        &self,
        record: &LocatedBlock,
        server: &ServerCandidate,
        pos: u64,
    ) -> Result<OpenSession<C::Transfer>, TransferError> {
        let end = record.end().min(self.file_length());
        let key = self.current_encryption_key().await?;
        let spec = self.transfer_spec(record, server, pos - record.offset, end - pos, key);
        let transfer = self.ctx.cluster().open_transfer(spec).await?;
        Ok(OpenSession {
            transfer,
            block: record.clone(),
            server: server.clone(),
            end,
        })
    }

    pub(crate) async fn seek(&self, target: u64) -> Result<(), ReadError> {
        self.ensure_readable()?;
        let len = self.file_length();
        if target > len {
            return Err(ReadError::InvalidSeek { pos: target, len });
        }
        let mut cursor = self.cursor.lock().await;
        if target == cursor.pos {
            return Ok(());
        }
        if let Some(mut sess) = cursor.session.take() {
            let drain_max = self.ctx.config.seek_drain_max as u64;
            let in_place = target >= cursor.pos
                && target <= sess.end
                && target - cursor.pos <= drain_max;
            if in_place {
                // Small forward gap: drain the open transfer instead of
                // issuing a new request.
                match drain(&mut sess.transfer, (target - cursor.pos) as usize).await {
                    Ok(()) => cursor.session = Some(sess),
                    Err(err) => {
                        tracing::debug!(%err, "failed to drain toward seek target");
                        sess.transfer.close().await;
                    }
                }
            } else {
                sess.transfer.close().await;
            }
        }
        cursor.pos = target;
        Ok(())
    }

    pub(crate) async fn seek_to_new_source(&self, target: u64) -> Result<bool, ReadError> {
        self.ensure_readable()?;
        let len = self.file_length();
        if target > len {
            return Err(ReadError::InvalidSeek { pos: target, len });
        }
        let mut cursor = self.cursor.lock().await;
        let mut failures = 0u32;
        let Some(old) = cursor.session.take() else {
            // No current server to move away from; a plain reopen suffices.
            let sess = self
                .open_session_at(target, &HashSet::new(), &mut failures)
                .await?;
            cursor.pos = target;
            cursor.session = Some(sess);
            return Ok(true);
        };
        let old_server = old.server.clone();
        old.transfer.close().await;
        // Quarantine the current server only for the duration of the
        // selection, so a healthy server is not penalized beyond this call.
        let was_dead = self.dead.is_dead(&old_server.addr);
        self.dead.mark_dead(&old_server.addr);
        let result = self
            .open_session_at(target, &HashSet::new(), &mut failures)
            .await;
        if !was_dead {
            self.dead.remove(&old_server.addr);
        }
        let sess = result?;
        let different = sess.server.identity != old_server.identity;
        tracing::debug!(
            from = %old_server.addr,
            to = %sess.server.addr,
            different,
            "sought to new source",
        );
        cursor.pos = target;
        cursor.session = Some(sess);
        Ok(different)
    }
}

/// Read and discard exactly `len` bytes from an open transfer.
async fn drain<T: BlockTransfer>(transfer: &mut T, len: usize) -> Result<(), TransferError> {
    let mut scratch = [0u8; 4096];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(scratch.len());
        match transfer.read(&mut scratch[..n]).await? {
            0 => {
                return Err(TransferError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "transfer ended while draining",
                )))
            }
            read => remaining -= read,
        }
    }
    Ok(())
}
