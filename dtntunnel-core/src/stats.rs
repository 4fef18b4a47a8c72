//! Throughput counters.
//!
//! The coordinator bumps these on every bundle sent or received. The
//! reporter reads them once per interval; the windowed counters reset on read
//! and the running total does not.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bundle and byte counters shared between the data path and the reporter
#[derive(Debug, Default)]
pub struct ThroughputStats {
    /// Bundles since the last snapshot
    bundles: AtomicU64,
    /// Bytes since the last snapshot
    bytes: AtomicU64,
    /// Bundles since start
    total_bundles: AtomicU64,
}

/// Point-in-time view of [`ThroughputStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThroughputSnapshot {
    pub bundles: u64,
    pub bytes: u64,
    pub total_bundles: u64,
}

impl ThroughputSnapshot {
    /// Megabits per second over `interval`
    pub fn mbits_per_sec(&self, interval: Duration) -> f64 {
        let secs = interval.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / secs / 1_000_000.0
    }
}

impl ThroughputStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one bundle of `len` bytes
    pub fn record(&self, len: usize) {
        self.bundles.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.total_bundles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_bundles(&self) -> u64 {
        self.total_bundles.load(Ordering::Relaxed)
    }

    /// Read and reset the windowed counters
    #[must_use]
    pub fn snapshot_and_reset(&self) -> ThroughputSnapshot {
        ThroughputSnapshot {
            bundles: self.bundles.swap(0, Ordering::Relaxed),
            bytes: self.bytes.swap(0, Ordering::Relaxed),
            total_bundles: self.total_bundles.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_resets_window_only() {
        let stats = ThroughputStats::new();
        stats.record(100);
        stats.record(50);

        let snap = stats.snapshot_and_reset();
        assert_eq!(
            snap,
            ThroughputSnapshot {
                bundles: 2,
                bytes: 150,
                total_bundles: 2
            }
        );

        stats.record(10);
        let snap = stats.snapshot_and_reset();
        assert_eq!(snap.bundles, 1);
        assert_eq!(snap.bytes, 10);
        assert_eq!(snap.total_bundles, 3);
    }

    #[test]
    fn test_mbits_per_sec() {
        let snap = ThroughputSnapshot {
            bundles: 1,
            bytes: 125_000,
            total_bundles: 1,
        };
        assert!((snap.mbits_per_sec(Duration::from_secs(1)) - 1.0).abs() < f64::EPSILON);
        assert_eq!(snap.mbits_per_sec(Duration::ZERO), 0.0);
    }
}
