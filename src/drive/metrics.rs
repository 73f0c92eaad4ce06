//! Drive interface metrics
//!
//! Counters for every submission outcome plus power-of-two size
//! distributions per direction.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of power-of-two size buckets: `[<=1B, <=2B, .. <=16KB, .. >32MB]`.
const SIZE_BUCKETS: usize = 26;

/// Size distribution over exponential power-of-two buckets.
#[derive(Debug)]
pub struct SizeHistogram {
    buckets: [AtomicU64; SIZE_BUCKETS],
    count: AtomicU64,
    sum: AtomicU64,
}

impl SizeHistogram {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; SIZE_BUCKETS],
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    pub fn record(&self, size: u64) {
        let bucket = (64 - size.max(1).leading_zeros() as usize - 1).min(SIZE_BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(size, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean recorded size, zero when empty.
    pub fn average(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.sum.load(Ordering::Relaxed) / count
    }

    pub fn buckets(&self) -> [u64; SIZE_BUCKETS] {
        std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed))
    }
}

impl Default for SizeHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one drive interface instance.
#[derive(Debug, Default)]
pub struct DriveMetrics {
    /// Completion wakeups with no token behind them.
    pub spurious_events: AtomicU64,
    /// Completions carrying a negative result.
    pub completion_errors: AtomicU64,
    /// Write submissions rejected outright by the kernel.
    pub write_io_submission_errors: AtomicU64,
    /// Read submissions rejected outright by the kernel.
    pub read_io_submission_errors: AtomicU64,
    /// Synchronous fallbacks because no control block was free.
    pub force_sync_io_empty_iocb: AtomicU64,
    /// Synchronous fallbacks because the kernel queue was full.
    pub force_sync_io_eagain_error: AtomicU64,
    pub async_write_count: AtomicU64,
    pub async_read_count: AtomicU64,
    pub sync_write_count: AtomicU64,
    pub sync_read_count: AtomicU64,
    pub write_io_sizes: SizeHistogram,
    pub read_io_sizes: SizeHistogram,
}

impl DriveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DriveMetricsSnapshot {
        DriveMetricsSnapshot {
            spurious_events: self.spurious_events.load(Ordering::Relaxed),
            completion_errors: self.completion_errors.load(Ordering::Relaxed),
            write_io_submission_errors: self.write_io_submission_errors.load(Ordering::Relaxed),
            read_io_submission_errors: self.read_io_submission_errors.load(Ordering::Relaxed),
            force_sync_io_empty_iocb: self.force_sync_io_empty_iocb.load(Ordering::Relaxed),
            force_sync_io_eagain_error: self.force_sync_io_eagain_error.load(Ordering::Relaxed),
            async_write_count: self.async_write_count.load(Ordering::Relaxed),
            async_read_count: self.async_read_count.load(Ordering::Relaxed),
            sync_write_count: self.sync_write_count.load(Ordering::Relaxed),
            sync_read_count: self.sync_read_count.load(Ordering::Relaxed),
            write_io_size_avg: self.write_io_sizes.average(),
            read_io_size_avg: self.read_io_sizes.average(),
        }
    }
}

/// Point-in-time copy of the drive counters.
#[derive(Debug, Clone)]
pub struct DriveMetricsSnapshot {
    pub spurious_events: u64,
    pub completion_errors: u64,
    pub write_io_submission_errors: u64,
    pub read_io_submission_errors: u64,
    pub force_sync_io_empty_iocb: u64,
    pub force_sync_io_eagain_error: u64,
    pub async_write_count: u64,
    pub async_read_count: u64,
    pub sync_write_count: u64,
    pub sync_read_count: u64,
    pub write_io_size_avg: u64,
    pub read_io_size_avg: u64,
}
