//! Per-thread reactor metrics
//!
//! Plain atomic counters; an external collector reads snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by one reactor thread.
///
/// `io_count` doubles as the load-balancing metric: the manager reads it
/// when picking the least-busy thread and tolerates staleness.
#[derive(Debug)]
pub struct ReactorMetrics {
    /// Events dispatched by this thread (multiplexer readiness + messages).
    pub io_count: AtomicU64,
    /// Messages drained from the queue.
    pub msg_recvd_count: AtomicU64,
    /// Descriptor dispatches rescheduled into this thread.
    pub rescheduled_in: AtomicU64,
    /// Times this thread was asked to give up io-thread status.
    pub rescheduled_out: AtomicU64,
}

impl ReactorMetrics {
    pub const fn new() -> Self {
        Self {
            io_count: AtomicU64::new(0),
            msg_recvd_count: AtomicU64::new(0),
            rescheduled_in: AtomicU64::new(0),
            rescheduled_out: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> ReactorMetricsSnapshot {
        ReactorMetricsSnapshot {
            io_count: self.io_count.load(Ordering::Relaxed),
            msg_recvd_count: self.msg_recvd_count.load(Ordering::Relaxed),
            rescheduled_in: self.rescheduled_in.load(Ordering::Relaxed),
            rescheduled_out: self.rescheduled_out.load(Ordering::Relaxed),
        }
    }
}

impl Default for ReactorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of one thread's counters.
#[derive(Debug, Clone)]
pub struct ReactorMetricsSnapshot {
    pub io_count: u64,
    pub msg_recvd_count: u64,
    pub rescheduled_in: u64,
    pub rescheduled_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_counters() {
        let metrics = ReactorMetrics::new();
        metrics.io_count.store(7, Ordering::Relaxed);
        metrics.msg_recvd_count.store(3, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert_eq!(snap.io_count, 7);
        assert_eq!(snap.msg_recvd_count, 3);
        assert_eq!(snap.rescheduled_in, 0);
    }
}
