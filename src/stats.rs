//! Numeric rollups and the detailed JSON report.
//!
//! [StatInfo] is one bucket of counters; the allocator produces one per
//! memory type, one per heap, and one grand total in [Stats]. The JSON dump
//! built by [Allocator::build_stats_string](crate::allocator::Allocator::build_stats_string)
//! is for external tooling (log files, capture viewers), not for
//! programmatic consumption.

use serde::Serialize;

/// Counters over a set of blocks and the allocations inside them.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatInfo {
    pub block_count: u32,
    pub allocation_count: u32,
    pub unused_range_count: u32,
    pub used_bytes: u64,
    pub unused_bytes: u64,
    pub allocation_size_min: u64,
    pub allocation_size_avg: u64,
    pub allocation_size_max: u64,
    pub unused_range_size_min: u64,
    pub unused_range_size_avg: u64,
    pub unused_range_size_max: u64,
}

impl StatInfo {
    pub fn new() -> StatInfo {
        StatInfo {
            block_count: 0,
            allocation_count: 0,
            unused_range_count: 0,
            used_bytes: 0,
            unused_bytes: 0,
            allocation_size_min: u64::max_value(),
            allocation_size_avg: 0,
            allocation_size_max: 0,
            unused_range_size_min: u64::max_value(),
            unused_range_size_avg: 0,
            unused_range_size_max: 0,
        }
    }

    pub(crate) fn add_allocation(&mut self, size: u64) {
        self.allocation_count += 1;
        self.used_bytes += size;
        self.allocation_size_min = self.allocation_size_min.min(size);
        self.allocation_size_max = self.allocation_size_max.max(size);
    }

    pub(crate) fn add_unused_range(&mut self, size: u64) {
        self.unused_range_count += 1;
        self.unused_bytes += size;
        self.unused_range_size_min = self.unused_range_size_min.min(size);
        self.unused_range_size_max = self.unused_range_size_max.max(size);
    }

    pub(crate) fn merge(&mut self, other: &StatInfo) {
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.unused_range_count += other.unused_range_count;
        self.used_bytes += other.used_bytes;
        self.unused_bytes += other.unused_bytes;
        self.allocation_size_min = self.allocation_size_min.min(other.allocation_size_min);
        self.allocation_size_max = self.allocation_size_max.max(other.allocation_size_max);
        self.unused_range_size_min = self.unused_range_size_min.min(other.unused_range_size_min);
        self.unused_range_size_max = self.unused_range_size_max.max(other.unused_range_size_max);
    }

    /// Computes averages and clears untouched minimums. Call once, after
    /// the last merge.
    pub(crate) fn post_process(&mut self) {
        if self.allocation_count > 0 {
            self.allocation_size_avg = self.used_bytes / self.allocation_count as u64;
        } else {
            self.allocation_size_min = 0;
        }
        if self.unused_range_count > 0 {
            self.unused_range_size_avg = self.unused_bytes / self.unused_range_count as u64;
        } else {
            self.unused_range_size_min = 0;
        }
    }
}

impl Default for StatInfo {
    fn default() -> StatInfo { StatInfo::new() }
}

/// Full rollup: per memory type, per heap, and overall.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub memory_type: Vec<StatInfo>,
    pub memory_heap: Vec<StatInfo>,
    pub total: StatInfo,
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    mod statinfo {
        use crate::stats::StatInfo;

        #[test]
        fn averages_and_untouched_minimums() {
            let mut info = StatInfo::new();
            info.add_allocation(100);
            info.add_allocation(300);
            info.post_process();
            assert_eq!(info.allocation_size_avg, 200);
            assert_eq!(info.allocation_size_min, 100);
            assert_eq!(info.allocation_size_max, 300);
            // no unused ranges seen: min must read as zero, not MAX
            assert_eq!(info.unused_range_size_min, 0);
        }

        #[test]
        fn merge_accumulates_extremes() {
            let mut a = StatInfo::new();
            a.add_allocation(64);
            let mut b = StatInfo::new();
            b.add_allocation(512);
            b.add_unused_range(32);
            a.merge(&b);
            a.post_process();
            assert_eq!(a.allocation_count, 2);
            assert_eq!(a.allocation_size_min, 64);
            assert_eq!(a.allocation_size_max, 512);
            assert_eq!(a.unused_bytes, 32);
        }
    }
}
