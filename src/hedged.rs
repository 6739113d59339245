//! Hedged reads: race a second replica when the first is slow.
//!
//! The primary attempt gets the configured threshold; on expiry a secondary
//! attempt launches against a different, untried server and whichever
//! completes first wins. Cancellation of losers is advisory — an aborted
//! attempt may still deliver a result, which is discarded without side
//! effects on the caller. Attempt concurrency is bounded client-wide by the
//! context's permit pool.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::block::{LocatedBlock, ServerAddress, ServerCandidate};
use crate::cluster::Cluster;
use crate::error::ReadError;
use crate::handle::Handle;
use crate::select::choose_server;
use crate::session::{AttemptError, CorruptTracker};

type AttemptResult = (ServerCandidate, HedgedOutcome);

#[derive(Debug)]
enum HedgedOutcome {
    Data(Vec<u8>),
    /// Checksum mismatch; the record carries the replica count for the
    /// corruption-report policy.
    Checksum(LocatedBlock),
    Fatal(ReadError),
    /// Server-level failure, already quarantined by the attempt.
    Failed,
}

enum Launch {
    Launched,
    /// No untried, healthy candidate remains.
    Dry(LocatedBlock),
}

impl<C: Cluster> Handle<C> {
    pub(crate) async fn hedged_fetch_block_range(
        this: &Arc<Self>,
        abs_start: u64,
        target: &mut [u8],
    ) -> Result<(), ReadError> {
        let mut corrupt = CorruptTracker::default();
        let mut attempts = JoinSet::new();
        let result = Self::hedged_race(this, abs_start, target, &mut attempts, &mut corrupt).await;
        // Advisory cancellation: losers may run to completion anyway; their
        // results die with the set.
        attempts.abort_all();
        drop(attempts);
        this.report_corruption(corrupt).await;
        result
    }

    async fn hedged_race(
        this: &Arc<Self>,
        abs_start: u64,
        target: &mut [u8],
        attempts: &mut JoinSet<AttemptResult>,
        corrupt: &mut CorruptTracker,
    ) -> Result<(), ReadError> {
        let threshold = this.ctx.config.hedged_read_threshold();
        let len = target.len();
        let mut ignore: HashSet<ServerAddress> = HashSet::new();
        let mut failures = 0u32;
        // Set once the primary has outrun the threshold; from then on
        // completions are awaited without one.
        let mut hedged = false;
        let mut hedge_pending = false;
        loop {
            if attempts.is_empty() {
                if let Launch::Dry(record) =
                    Self::launch_attempt(this, abs_start, len, &mut ignore, attempts).await?
                {
                    // Nothing in flight and nothing left to try.
                    this.exhausted_candidates(&record, &mut failures, Some(&mut ignore))
                        .await?;
                    continue;
                }
            } else if hedge_pending {
                hedge_pending = false;
                match Self::launch_attempt(this, abs_start, len, &mut ignore, attempts).await? {
                    Launch::Launched => tracing::debug!("hedged attempt launched"),
                    Launch::Dry(_) => {
                        tracing::debug!("no untried replica to hedge with, waiting on primary");
                    }
                }
            }

            let joined = if hedged {
                attempts.join_next().await
            } else {
                match tokio::time::timeout(threshold, attempts.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::debug!(
                            threshold_ms = threshold.as_millis() as u64,
                            "primary attempt over threshold, hedging",
                        );
                        hedged = true;
                        hedge_pending = true;
                        continue;
                    }
                }
            };
            let Some(joined) = joined else { continue };
            let (server, outcome) = match joined {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => continue,
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            };
            match outcome {
                HedgedOutcome::Data(bytes) => {
                    target.copy_from_slice(&bytes);
                    return Ok(());
                }
                HedgedOutcome::Checksum(record) => {
                    tracing::warn!(
                        block = %record.block,
                        server = %server.addr,
                        "checksum mismatch on hedged attempt",
                    );
                    corrupt.add(&record, &server.addr);
                }
                HedgedOutcome::Fatal(err) => return Err(err),
                HedgedOutcome::Failed => {}
            }
        }
    }

    /// Resolve, choose an untried server, and spawn an attempt against it.
    /// The chosen address joins the ignore set immediately so later
    /// launches within this race pick distinct servers.
    async fn launch_attempt(
        this: &Arc<Self>,
        abs_start: u64,
        len: usize,
        ignore: &mut HashSet<ServerAddress>,
        attempts: &mut JoinSet<AttemptResult>,
    ) -> Result<Launch, ReadError> {
        let record = this.resolve_block(abs_start).await?;
        let Some(server) = choose_server(&record, &this.dead, ignore) else {
            return Ok(Launch::Dry(record));
        };
        tracing::debug!(
            block = %record.block,
            server = %server.addr,
            "launching read attempt",
        );
        ignore.insert(server.addr.clone());
        let handle = Arc::clone(this);
        attempts.spawn(async move { handle.hedged_attempt(abs_start, server, len).await });
        Ok(Launch::Launched)
    }

    async fn hedged_attempt(
        self: Arc<Self>,
        abs_start: u64,
        server: ServerCandidate,
        len: usize,
    ) -> AttemptResult {
        let _permit = self.ctx.hedge_permit().await;
        let mut buf = vec![0u8; len];
        // Locations may change between launches within a single race;
        // re-resolve right before choosing what to open.
        let record = match self.resolve_block(abs_start).await {
            Ok(record) => record,
            Err(err) => return (server, HedgedOutcome::Fatal(err)),
        };
        let offset_in_block = abs_start - record.offset;
        let outcome = match self
            .fetch_attempt(&record, &server, offset_in_block, &mut buf)
            .await
        {
            Ok(()) => HedgedOutcome::Data(buf),
            Err(AttemptError::Checksum) => {
                self.dead.mark_dead(&server.addr);
                HedgedOutcome::Checksum(record)
            }
            Err(AttemptError::Fatal(err)) => HedgedOutcome::Fatal(err),
            Err(AttemptError::Failed(err)) => {
                tracing::warn!(
                    block = %record.block,
                    server = %server.addr,
                    %err,
                    "hedged attempt failed",
                );
                self.dead.mark_dead(&server.addr);
                HedgedOutcome::Failed
            }
        };
        (server, outcome)
    }
}
