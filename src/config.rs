use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use thiserror::Error;

use crate::block::CachingStrategy;

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct InvalidConfig(String);

#[serde_inline_default]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Verify block checksums on every transfer.
    #[serde_inline_default(true)]
    pub verify_checksums: bool,

    /// Race a second replica when the first is slow. Positional reads only.
    #[serde_inline_default(false)]
    pub hedged_reads: bool,
    /// How long the primary attempt gets before a hedged attempt launches.
    #[serde_inline_default(500)]
    pub hedged_read_threshold_ms: u64,
    /// Upper bound on concurrently running hedged attempts per client.
    #[serde_inline_default(NonZeroUsize::new(16).unwrap())]
    pub hedged_read_limit: NonZeroUsize,

    /// Refresh-and-retry cycles per logical read before a block is declared
    /// missing. This bounds the only otherwise-unbounded retry loop.
    #[serde_inline_default(3)]
    pub max_block_acquire_failures: u32,
    /// Base wait between refresh cycles; actual wait grows linearly with the
    /// failure count plus jitter.
    #[serde_inline_default(3_000)]
    pub retry_window_ms: u64,

    /// Rounds of re-fetching locations when the in-progress last block has
    /// no candidates to report its length yet.
    #[serde_inline_default(3)]
    pub last_block_probe_retries: u32,
    #[serde_inline_default(4_000)]
    pub last_block_probe_retry_delay_ms: u64,

    /// Hand out memory-mapped views when a short-circuit transfer offers
    /// them; otherwise `read_buffer` copies through the buffer pool.
    #[serde_inline_default(true)]
    pub zero_copy_reads: bool,

    /// Largest forward seek served by draining the open transfer in place
    /// instead of reopening a session.
    #[serde_inline_default(64 << 10)]
    #[serde(deserialize_with = "de_size")]
    pub seek_drain_max: usize,

    /// How much location metadata to request per metadata query.
    #[serde_inline_default(10 * (128 << 20))]
    #[serde(deserialize_with = "de_size64")]
    pub locate_prefetch: u64,

    #[serde(default)]
    pub caching: CachingStrategy,
}

fn de_size<'de, D: serde::de::Deserializer<'de>>(de: D) -> Result<usize, D::Error> {
    use serde::de::Error;

    let n = bytesize::ByteSize::deserialize(de)?;
    n.0.try_into()
        .map_err(|_| D::Error::custom(format_args!("overflow: {}", n.0)))
}

fn de_size64<'de, D: serde::de::Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    Ok(bytesize::ByteSize::deserialize(de)?.0)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            hedged_reads: false,
            hedged_read_threshold_ms: 500,
            hedged_read_limit: NonZeroUsize::new(16).unwrap(),
            max_block_acquire_failures: 3,
            retry_window_ms: 3_000,
            last_block_probe_retries: 3,
            last_block_probe_retry_delay_ms: 4_000,
            zero_copy_reads: true,
            seek_drain_max: 64 << 10,
            locate_prefetch: 10 * (128 << 20),
            caching: CachingStrategy::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.hedged_read_threshold_ms == 0 {
            return Err(InvalidConfig(
                "`hedged_read_threshold_ms` must be nonzero".into(),
            ));
        }
        if self.retry_window_ms == 0 {
            return Err(InvalidConfig("`retry_window_ms` must be nonzero".into()));
        }
        if self.last_block_probe_retries == 0 {
            return Err(InvalidConfig(
                "`last_block_probe_retries` must be nonzero".into(),
            ));
        }
        if self.locate_prefetch == 0 {
            return Err(InvalidConfig("`locate_prefetch` must be nonzero".into()));
        }
        Ok(())
    }

    pub fn hedged_read_threshold(&self) -> Duration {
        Duration::from_millis(self.hedged_read_threshold_ms)
    }

    pub fn last_block_probe_retry_delay(&self) -> Duration {
        Duration::from_millis(self.last_block_probe_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_threshold() {
        let config = Config {
            hedged_read_threshold_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
