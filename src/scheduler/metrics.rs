use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters and gauges for a [`Scheduler`](super::Scheduler).
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    launched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    /// Tasks currently parked on a continuation
    suspended: AtomicUsize,
    /// Tasks launched but not yet finished
    active: AtomicUsize,
    /// Deadline watchdogs still sleeping
    watchdogs: AtomicUsize,
}

/// Point-in-time copy of [`SchedulerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub launched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub suspended: usize,
    pub active: usize,
    pub watchdogs: usize,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_launch(&self) {
        self.launched.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, cancelled: bool) {
        if cancelled {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_suspend(&self) {
        self.suspended.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.suspended.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_watchdog_start(&self) {
        self.watchdogs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_watchdog_stop(&self) {
        self.watchdogs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            launched: self.launched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            suspended: self.suspended.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            watchdogs: self.watchdogs.load(Ordering::Relaxed),
        }
    }
}
