//! Stats Module - GC Performance Monitoring
//!
//! Collects collector statistics for tuning and debugging:
//! - Per-cycle heap accounting (`HeapStat`)
//! - Per-cycle run report (`GcRunStats`)
//! - Process-wide counters and the pause histogram (`GcStats`)

pub mod histogram;
pub mod timer;

pub use histogram::Histogram;
pub use timer::PhaseTimer;

use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::gc::{GcKind, InitiationPoint};

/// Heap accounting of one collect pass
///
/// Allocators report one `HeapStat` each; the collector sums them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStat {
    /// Bytes owned by the allocator before the pass
    pub mem_before_gc: usize,
    /// Bytes still owned after empty memory was released
    pub mem_occupied: usize,
    /// Bytes in live (marked) cells
    pub mem_live: usize,
    /// Bytes in cells reclaimed by the pass
    pub mem_freed: usize,
    /// Bytes moved by compaction
    pub mem_copied: usize,
    /// Number of pinned live cells
    pub pinned_count: usize,
}

impl HeapStat {
    /// Live bytes as a fraction of occupied bytes
    pub fn residency(&self) -> f64 {
        if self.mem_occupied == 0 {
            return 0.0;
        }
        self.mem_live as f64 / self.mem_occupied as f64
    }
}

impl Add for HeapStat {
    type Output = HeapStat;

    fn add(mut self, other: HeapStat) -> HeapStat {
        self += other;
        self
    }
}

impl AddAssign for HeapStat {
    fn add_assign(&mut self, other: HeapStat) {
        self.mem_before_gc += other.mem_before_gc;
        self.mem_occupied += other.mem_occupied;
        self.mem_live += other.mem_live;
        self.mem_freed += other.mem_freed;
        self.mem_copied += other.mem_copied;
        self.pinned_count += other.pinned_count;
    }
}

/// Report of one `gc()` call
#[derive(Debug, Clone, Serialize)]
pub struct GcRunStats {
    /// Cycle number (1-based)
    pub cycle: u64,
    pub kind: GcKind,
    pub reason: InitiationPoint,
    /// Time the world was stopped
    pub pause: Duration,
    pub mark_time: Duration,
    pub collect_time: Duration,
    pub heap: HeapStat,
    /// Cells marked by this cycle's final drain
    pub marked_cells: usize,
    /// The mark packet pool overflowed and marking was redone serially
    pub overflow: bool,
    /// Threads suspended by the stop-the-world
    pub threads_stopped: usize,
}

impl GcRunStats {
    pub(crate) fn new(cycle: u64, kind: GcKind, reason: InitiationPoint) -> Self {
        Self {
            cycle,
            kind,
            reason,
            pause: Duration::ZERO,
            mark_time: Duration::ZERO,
            collect_time: Duration::ZERO,
            heap: HeapStat::default(),
            marked_cells: 0,
            overflow: false,
            threads_stopped: 0,
        }
    }
}

/// GcStats - process-wide collector counters
pub struct GcStats {
    cycles: AtomicU64,
    concurrent_marks: AtomicU64,
    overflows: AtomicU64,
    bytes_freed: AtomicU64,
    bytes_copied: AtomicU64,
    pauses: Histogram,
    start_time: Instant,
}

impl GcStats {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            concurrent_marks: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
            pauses: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    /// Account one finished `gc()` call
    pub fn record(&self, run: &GcRunStats) {
        match run.kind {
            GcKind::Collect => {
                self.cycles.fetch_add(1, Ordering::Relaxed);
                self.bytes_freed
                    .fetch_add(run.heap.mem_freed as u64, Ordering::Relaxed);
                self.bytes_copied
                    .fetch_add(run.heap.mem_copied as u64, Ordering::Relaxed);
            }
            GcKind::LaunchConcurrentMark => {
                self.concurrent_marks.fetch_add(1, Ordering::Relaxed);
            }
        }
        if run.overflow {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        self.pauses.record(run.pause.as_nanos() as u64);
    }

    pub fn pause_histogram(&self) -> &Histogram {
        &self.pauses
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            concurrent_marks: self.concurrent_marks.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            pause_count: self.pauses.count(),
            avg_pause_ms: self.pauses.mean() as f64 / 1_000_000.0,
            p99_pause_ms: self.pauses.p99() as f64 / 1_000_000.0,
            max_pause_ms: self.pauses.max() as f64 / 1_000_000.0,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn reset(&self) {
        self.cycles.store(0, Ordering::Relaxed);
        self.concurrent_marks.store(0, Ordering::Relaxed);
        self.overflows.store(0, Ordering::Relaxed);
        self.bytes_freed.store(0, Ordering::Relaxed);
        self.bytes_copied.store(0, Ordering::Relaxed);
        self.pauses.clear();
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcStatsSnapshot {
    /// Completed collections
    pub cycles: u64,
    /// Concurrent marks launched
    pub concurrent_marks: u64,
    /// Cycles that hit a mark packet overflow
    pub overflows: u64,
    pub bytes_freed: u64,
    pub bytes_copied: u64,
    pub pause_count: u64,
    pub avg_pause_ms: f64,
    pub p99_pause_ms: f64,
    pub max_pause_ms: f64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_stat_sum_and_residency() {
        let a = HeapStat {
            mem_occupied: 100,
            mem_live: 40,
            pinned_count: 1,
            ..Default::default()
        };
        let b = HeapStat {
            mem_occupied: 100,
            mem_live: 60,
            mem_freed: 8,
            ..Default::default()
        };
        let sum = a + b;
        assert_eq!(sum.mem_occupied, 200);
        assert_eq!(sum.mem_freed, 8);
        assert_eq!(sum.pinned_count, 1);
        assert!((sum.residency() - 0.5).abs() < f64::EPSILON);
        assert_eq!(HeapStat::default().residency(), 0.0);
    }

    #[test]
    fn test_record_counts_by_kind() {
        let stats = GcStats::new();
        let mut run = GcRunStats::new(1, GcKind::Collect, InitiationPoint::UserRequest);
        run.heap.mem_freed = 64;
        stats.record(&run);
        stats.record(&GcRunStats::new(
            2,
            GcKind::LaunchConcurrentMark,
            InitiationPoint::MarkThreshold,
        ));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.concurrent_marks, 1);
        assert_eq!(snapshot.bytes_freed, 64);
        assert_eq!(snapshot.pause_count, 2);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"cycles\":1"));
    }
}
