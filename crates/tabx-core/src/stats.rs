//! # Transport Statistics
//!
//! Lock-free counters tracking data completeness through the transpose
//! pipeline. Loss is the *designed-for* failure mode here — subbands that
//! never arrive are zero-filled, late stragglers are discarded — so the
//! counters exist to make the loss rate visible without logging every
//! occurrence at wire speed.
//!
//! Per-block loss is reported at `debug` level; a `warn`-level summary with
//! the aggregate loss percentage is emitted once per reporting interval, and
//! only when the interval actually lost data.
//!
//! ## Example
//!
//! ```rust
//! use tabx_core::stats::TransposeStats;
//!
//! let stats = TransposeStats::new();
//! stats.record_received(4);
//! // 3 of 4 subband slots were present, 1 was zero-filled
//! stats.record_block_written(3, 1, 0);
//!
//! let snap = stats.snapshot();
//! assert_eq!(snap.blocks_emitted, 1);
//! assert_eq!(snap.subbands_lost, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Blocks between `warn`-level loss summaries.
const REPORT_INTERVAL_BLOCKS: u64 = 64;

/// Atomic counters shared by a collector's worker loops.
///
/// All updates are relaxed: the counters feed monitoring, not control flow.
#[derive(Debug, Default)]
pub struct TransposeStats {
    subbands_received: AtomicU64,
    subbands_late: AtomicU64,
    subbands_written: AtomicU64,
    subbands_lost: AtomicU64,
    blocks_emitted: AtomicU64,
    blocks_complete: AtomicU64,
    blocks_evicted: AtomicU64,
    interval_lost: AtomicU64,
    interval_expected: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub subbands_received: u64,
    pub subbands_late: u64,
    pub subbands_written: u64,
    pub subbands_lost: u64,
    pub blocks_emitted: u64,
    pub blocks_complete: u64,
    pub blocks_evicted: u64,
}

impl StatsSnapshot {
    /// Fraction of expected subbands that had to be zero-filled, in 0..=1.
    pub fn loss_ratio(&self) -> f64 {
        let expected = self.subbands_written + self.subbands_lost;
        if expected == 0 {
            0.0
        } else {
            self.subbands_lost as f64 / expected as f64
        }
    }
}

impl TransposeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count subbands accepted off the wire or local producer.
    #[inline]
    pub fn record_received(&self, n: u64) {
        self.subbands_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Count a subband that arrived after its block was already emitted.
    #[inline]
    pub fn record_late_drop(&self) {
        self.subbands_late.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a block force-emitted to make room in the in-flight window.
    #[inline]
    pub fn record_eviction(&self) {
        self.blocks_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one block handed downstream: how many subband slots were
    /// present vs. zero-filled. Emits the periodic loss report.
    pub fn record_block_written(&self, present: u64, lost: u64, block_index: u64) {
        self.subbands_written.fetch_add(present, Ordering::Relaxed);
        self.subbands_lost.fetch_add(lost, Ordering::Relaxed);
        if lost == 0 {
            self.blocks_complete.fetch_add(1, Ordering::Relaxed);
        } else {
            let total = present + lost;
            tracing::debug!(
                block_index,
                lost,
                total,
                "block written with {:.1}% of subbands zero-filled",
                100.0 * lost as f64 / total as f64
            );
        }
        self.interval_lost.fetch_add(lost, Ordering::Relaxed);
        self.interval_expected
            .fetch_add(present + lost, Ordering::Relaxed);

        let emitted = self.blocks_emitted.fetch_add(1, Ordering::Relaxed) + 1;
        if emitted % REPORT_INTERVAL_BLOCKS == 0 {
            let lost = self.interval_lost.swap(0, Ordering::Relaxed);
            let expected = self.interval_expected.swap(0, Ordering::Relaxed);
            if lost > 0 && expected > 0 {
                tracing::warn!(
                    "lost {:.2}% of subbands over the last {} blocks",
                    100.0 * lost as f64 / expected as f64,
                    REPORT_INTERVAL_BLOCKS
                );
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            subbands_received: self.subbands_received.load(Ordering::Relaxed),
            subbands_late: self.subbands_late.load(Ordering::Relaxed),
            subbands_written: self.subbands_written.load(Ordering::Relaxed),
            subbands_lost: self.subbands_lost.load(Ordering::Relaxed),
            blocks_emitted: self.blocks_emitted.load(Ordering::Relaxed),
            blocks_complete: self.blocks_complete.load(Ordering::Relaxed),
            blocks_evicted: self.blocks_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = TransposeStats::new();
        stats.record_received(8);
        stats.record_late_drop();
        stats.record_block_written(4, 0, 0);
        stats.record_block_written(3, 1, 1);
        stats.record_eviction();

        let snap = stats.snapshot();
        assert_eq!(snap.subbands_received, 8);
        assert_eq!(snap.subbands_late, 1);
        assert_eq!(snap.subbands_written, 7);
        assert_eq!(snap.subbands_lost, 1);
        assert_eq!(snap.blocks_emitted, 2);
        assert_eq!(snap.blocks_complete, 1);
        assert_eq!(snap.blocks_evicted, 1);
    }

    #[test]
    fn test_loss_ratio() {
        let stats = TransposeStats::new();
        stats.record_block_written(3, 1, 0);
        assert!((stats.snapshot().loss_ratio() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_loss_ratio_no_data() {
        let stats = TransposeStats::new();
        assert_eq!(stats.snapshot().loss_ratio(), 0.0);
    }
}
