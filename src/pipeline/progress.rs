//! Lock-free progress counters.
//!
//! A tracker is owned by one sink and shared with the run handle. The sink
//! mutates it with atomic increments; readers take snapshots at any time.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Units or entities completed.
    pub finished: u64,
    /// Units or entities expected, fixed when enumeration completes.
    pub total: u64,
    /// Rows written.
    pub rows: u64,
}

impl ProgressSnapshot {
    /// Fraction complete in `[0, 1]`; an empty run counts as complete.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.finished as f64 / self.total as f64).min(1.0)
        }
    }
}

impl std::ops::Add for ProgressSnapshot {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            finished: self.finished + other.finished,
            total: self.total + other.total,
            rows: self.rows + other.rows,
        }
    }
}

impl std::iter::Sum for ProgressSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, s| acc + s)
    }
}

/// Counters of one sink.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    finished: AtomicU64,
    total: AtomicU64,
    rows: AtomicU64,
    open_resources: AtomicUsize,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    pub fn finish_one(&self) {
        self.finished.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add_rows(&self, rows: u64) {
        self.rows.fetch_add(rows, Ordering::AcqRel);
    }

    pub fn resource_opened(&self) {
        self.open_resources.fetch_add(1, Ordering::AcqRel);
    }

    pub fn resource_closed(&self) {
        self.open_resources.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn open_resources(&self) -> usize {
        self.open_resources.load(Ordering::Acquire)
    }

    pub fn finished_rows(&self) -> u64 {
        self.rows.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            finished: self.finished.load(Ordering::Acquire),
            total: self.total.load(Ordering::Acquire),
            rows: self.rows.load(Ordering::Acquire),
        }
    }
}
