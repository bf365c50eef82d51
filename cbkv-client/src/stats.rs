//! # Pool Statistics
//!
//! Counters and an acquire-wait histogram for one connection pool.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events without
//!    touching the pool lock.
//! 2. **Fixed Buckets**: Wait-time buckets live in a contiguous array.
//! 3. **Plain Snapshots**: Readers get a point-in-time struct, never a live
//!    reference.
//!
//! ## Notes
//! - Bucket boundaries are in microseconds and span queue waits from a few
//!   microseconds up to the multi-second queue timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default acquire-wait bucket boundaries in microseconds.
pub const DEFAULT_WAIT_BUCKETS_US: [u64; 12] = [
    10, 50, 100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 2_500_000,
];

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Successful acquisitions.
    pub acquires: u64,
    /// Acquisitions that had to queue for a connection.
    pub waits: u64,
    /// Acquisitions that failed with `PoolExhausted`.
    pub exhausted: u64,
    /// Connections established.
    pub connects: u64,
    /// Connection attempts that failed or timed out.
    pub connect_failures: u64,
    /// Connections destroyed instead of returned.
    pub destroyed: u64,
    /// Acquisitions refused because the node was dead.
    pub rejected_dead: u64,
    /// Responses discarded because their correlation id did not match.
    pub stale_responses: u64,
    /// Connections currently open (idle + leased).
    pub open: u64,
    /// Connections currently idle.
    pub idle: u64,
    /// Acquire wait times.
    pub wait_latency: WaitSnapshot,
}

/// Snapshot of the wait histogram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    pub samples: u64,
    pub sum_us: u64,
}

/// Thread-safe pool counters.
#[derive(Debug)]
pub struct PoolStats {
    acquires: AtomicU64,
    waits: AtomicU64,
    exhausted: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
    destroyed: AtomicU64,
    rejected_dead: AtomicU64,
    stale_responses: AtomicU64,
    wait_latency: WaitHistogram,
}

impl PoolStats {
    pub fn new() -> Self {
        PoolStats {
            acquires: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            rejected_dead: AtomicU64::new(0),
            stale_responses: AtomicU64::new(0),
            wait_latency: WaitHistogram::new(DEFAULT_WAIT_BUCKETS_US.to_vec()),
        }
    }

    /// Records a successful acquisition and how long it waited.
    pub fn record_acquire(&self, waited: Duration, queued: bool) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        if queued {
            self.waits.fetch_add(1, Ordering::Relaxed);
        }
        self.wait_latency.record(waited);
    }

    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_dead(&self) {
        self.rejected_dead.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_response(&self) {
        self.stale_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot; `open` and `idle` come from the pool state.
    ///
    /// **Input**: current open and idle counts read under the pool lock.
    /// **Output**: `PoolStatsSnapshot` with point-in-time values.
    pub fn snapshot(&self, open: usize, idle: usize) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            acquires: self.acquires.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            rejected_dead: self.rejected_dead.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
            open: open as u64,
            idle: idle as u64,
            wait_latency: self.wait_latency.snapshot(),
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket wait-time histogram.
///
/// Linear bucket scan; the list is short and stays hot in cache.
#[derive(Debug)]
pub struct WaitHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl WaitHistogram {
    /// Creates a histogram with ascending bucket boundaries (microseconds).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        WaitHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Records a sample.
    ///
    /// **Logic**:
    /// 1. Convert to microseconds, saturating at `u64::MAX`.
    /// 2. Find the first boundary >= the sample; past the last boundary the
    ///    sample lands in the overflow bucket.
    /// 3. Bump the bucket, the sample count and the running sum.
    pub fn record(&self, sample: Duration) {
        let us = u64::try_from(sample.as_micros()).unwrap_or(u64::MAX);
        let idx = self
            .bounds_us
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WaitSnapshot {
        WaitSnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}
