use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-handle read counters. Each category refines the previous,
/// so `total >= local >= short_circuit >= zero_copy` holds at all times:
/// recording a read adds its bytes to its own category and every coarser
/// one. Reset only on explicit request.
#[derive(Debug, Default)]
pub(crate) struct ReadStatistics {
    total: AtomicU64,
    local: AtomicU64,
    short_circuit: AtomicU64,
    zero_copy: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadSource {
    Remote,
    Local,
    ShortCircuit,
    ZeroCopy,
}

impl ReadStatistics {
    pub(crate) fn record(&self, source: ReadSource, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
        if matches!(
            source,
            ReadSource::Local | ReadSource::ShortCircuit | ReadSource::ZeroCopy
        ) {
            self.local.fetch_add(bytes, Ordering::Relaxed);
        }
        if matches!(source, ReadSource::ShortCircuit | ReadSource::ZeroCopy) {
            self.short_circuit.fetch_add(bytes, Ordering::Relaxed);
        }
        if matches!(source, ReadSource::ZeroCopy) {
            self.zero_copy.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_bytes: self.total.load(Ordering::Relaxed),
            local_bytes: self.local.load(Ordering::Relaxed),
            short_circuit_bytes: self.short_circuit.load(Ordering::Relaxed),
            zero_copy_bytes: self.zero_copy.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.local.store(0, Ordering::Relaxed);
        self.short_circuit.store(0, Ordering::Relaxed);
        self.zero_copy.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a handle's read statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_bytes: u64,
    pub local_bytes: u64,
    pub short_circuit_bytes: u64,
    pub zero_copy_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_nested() {
        let stats = ReadStatistics::default();
        stats.record(ReadSource::Remote, 10);
        stats.record(ReadSource::Local, 20);
        stats.record(ReadSource::ShortCircuit, 30);
        stats.record(ReadSource::ZeroCopy, 40);
        let snap = stats.snapshot();
        assert_eq!(snap.total_bytes, 100);
        assert_eq!(snap.local_bytes, 90);
        assert_eq!(snap.short_circuit_bytes, 70);
        assert_eq!(snap.zero_copy_bytes, 40);
        assert!(snap.total_bytes >= snap.local_bytes);
        assert!(snap.local_bytes >= snap.short_circuit_bytes);
        assert!(snap.short_circuit_bytes >= snap.zero_copy_bytes);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
