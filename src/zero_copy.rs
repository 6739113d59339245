//! Zero-copy hand-out of memory-mapped views, with a pooled copying
//! fallback.
//!
//! Views are tracked in an outstanding-buffer registry keyed by opaque
//! tokens, so `release_buffer` can reject buffers this handle never issued
//! and `close` can warn about leaks. Pooled backings return to a small free
//! list on release; mapped backings unmap when the last reference drops.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::cluster::{BlockTransfer, Cluster, MappedRegion};
use crate::error::ReadError;
use crate::handle::{Cursor, Handle};
use crate::session::CorruptTracker;
use crate::stats::ReadSource;

/// Mapped views live in a 32-bit size/offset space; requests that would
/// cross this bound are shrunk, not failed.
const MAX_MAPPED_SPAN: u64 = i32::MAX as u64;

/// Pooled fallback buffers kept around for reuse.
const MAX_POOLED_BUFFERS: usize = 8;

/// Buffer ids are process-unique so a buffer can never be released against
/// the wrong handle's registry.
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A read-only, bounded view handed out by `read_buffer`. Return it via
/// `release_buffer`; dropping it without releasing leaks a registry entry
/// (reported at close) but no memory.
pub struct ZeroCopyBuffer {
    id: u64,
    backing: Backing,
}

enum Backing {
    Mapped(MappedRegion),
    Pooled(BytesMut),
}

impl Deref for ZeroCopyBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(region) => region.as_slice(),
            Backing::Pooled(buf) => buf,
        }
    }
}

impl fmt::Debug for ZeroCopyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.backing {
            Backing::Mapped(_) => "mapped",
            Backing::Pooled(_) => "pooled",
        };
        f.debug_struct("ZeroCopyBuffer")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

impl ZeroCopyBuffer {
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Mapped(region) => region.len(),
            Backing::Pooled(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
enum BackingKind {
    Mapped,
    Pooled,
}

#[derive(Debug, Default)]
pub(crate) struct BufferRegistry {
    outstanding: Mutex<HashMap<u64, BackingKind>>,
    pool: Mutex<Vec<BytesMut>>,
}

impl BufferRegistry {
    /// A zeroed buffer of exactly `len` bytes, reusing a pooled allocation
    /// when one is large enough.
    pub(crate) fn take_pooled(&self, len: usize) -> BytesMut {
        let reused = {
            let mut pool = self.pool.lock();
            pool.iter()
                .position(|b| b.capacity() >= len)
                .map(|i| pool.swap_remove(i))
        };
        let mut buf = reused.unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    pub(crate) fn recycle(&self, mut buf: BytesMut) {
        buf.clear();
        let mut pool = self.pool.lock();
        if pool.len() < MAX_POOLED_BUFFERS {
            pool.push(buf);
        }
    }

    pub(crate) fn issue_mapped(&self, region: MappedRegion) -> ZeroCopyBuffer {
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        self.outstanding.lock().insert(id, BackingKind::Mapped);
        ZeroCopyBuffer {
            id,
            backing: Backing::Mapped(region),
        }
    }

    pub(crate) fn issue_pooled(&self, mut buf: BytesMut, len: usize) -> ZeroCopyBuffer {
        buf.truncate(len);
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        self.outstanding.lock().insert(id, BackingKind::Pooled);
        ZeroCopyBuffer {
            id,
            backing: Backing::Pooled(buf),
        }
    }

    pub(crate) fn release(&self, buf: ZeroCopyBuffer) -> Result<(), ReadError> {
        match self.outstanding.lock().remove(&buf.id) {
            None => Err(ReadError::UnknownBuffer),
            Some(BackingKind::Pooled) => {
                if let Backing::Pooled(bytes) = buf.backing {
                    self.recycle(bytes);
                }
                Ok(())
            }
            // Dropping the region unmaps once the last reference is gone.
            Some(BackingKind::Mapped) => Ok(()),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }
}

impl<C: Cluster> Handle<C> {
    pub(crate) async fn read_buffer(
        &self,
        max_len: usize,
    ) -> Result<Option<ZeroCopyBuffer>, ReadError> {
        self.ensure_readable()?;
        if max_len == 0 {
            return Ok(None);
        }
        let mut cursor = self.cursor.lock().await;
        let mut corrupt = CorruptTracker::default();
        let result = self
            .read_buffer_inner(&mut cursor, max_len, &mut corrupt)
            .await;
        drop(cursor);
        self.report_corruption(corrupt).await;
        result
    }

    async fn read_buffer_inner(
        &self,
        cursor: &mut Cursor<C::Transfer>,
        max_len: usize,
        corrupt: &mut CorruptTracker,
    ) -> Result<Option<ZeroCopyBuffer>, ReadError> {
        let mut failures = 0u32;
        if !self.ensure_session(cursor, &mut failures).await? {
            return Ok(None);
        }
        if let Some(buf) = self.try_zero_copy(cursor, max_len) {
            return Ok(Some(buf));
        }

        // Copying fallback through the pooled read path. The span stays
        // within the current block, so this fills from one session unless a
        // failover replaces it mid-way.
        let end = cursor
            .session
            .as_ref()
            .expect("session was just ensured")
            .end;
        let span = usize::try_from(end - cursor.pos)
            .unwrap_or(usize::MAX)
            .min(max_len);
        let mut pooled = self.buffers.take_pooled(span);
        let mut filled = 0;
        while filled < span {
            match self
                .read_seq_inner(cursor, &mut pooled[filled..span], corrupt)
                .await?
            {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            self.buffers.recycle(pooled);
            return Ok(None);
        }
        Ok(Some(self.buffers.issue_pooled(pooled, filled)))
    }

    /// Attempt a zero-copy hand-out at the cursor. The span is clamped to
    /// the current block, the caller's bound and the mapped address space;
    /// `None` (zero-copy disabled, no short-circuit transfer, no map, or a
    /// span shrunk to nothing) means "fall back to copying".
    fn try_zero_copy(
        &self,
        cursor: &mut Cursor<C::Transfer>,
        max_len: usize,
    ) -> Option<ZeroCopyBuffer> {
        if !self.ctx.config.zero_copy_reads {
            return None;
        }
        let sess = cursor.session.as_mut()?;
        if !sess.transfer.is_short_circuit() {
            return None;
        }
        let offset_in_block = cursor.pos - sess.block.offset;
        let span = (sess.end - cursor.pos)
            .min(max_len as u64)
            .min(MAX_MAPPED_SPAN.saturating_sub(offset_in_block));
        if span == 0 {
            return None;
        }
        let region = sess.transfer.mapped_region(usize::try_from(span).ok()?)?;
        let len = region.len() as u64;
        cursor.pos += len;
        self.stats.record(ReadSource::ZeroCopy, len);
        tracing::debug!(
            block = %sess.block.block,
            len,
            "handed out zero-copy view"
        );
        Some(self.buffers.issue_mapped(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_rejects_foreign_buffers() {
        let a = BufferRegistry::default();
        let b = BufferRegistry::default();
        let buf = a.issue_pooled(BytesMut::from(&b"data"[..]), 4);
        assert!(matches!(b.release(buf), Err(ReadError::UnknownBuffer)));
        // The entry stays tracked by the issuer.
        assert_eq!(a.outstanding(), 1);
    }

    #[test]
    fn pooled_backing_is_reused() {
        let registry = BufferRegistry::default();
        let buf = registry.take_pooled(128);
        let cap = buf.capacity();
        let issued = registry.issue_pooled(buf, 64);
        assert_eq!(issued.len(), 64);
        registry.release(issued).unwrap();
        assert_eq!(registry.outstanding(), 0);
        let again = registry.take_pooled(100);
        assert_eq!(again.capacity(), cap);
    }
}
