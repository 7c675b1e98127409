//! Streaming statistics over heap objects and shared pointer arrays.

/// Objects of at least this many bytes count as large.
pub const LARGE_OBJECT_THRESHOLD: usize = 4096;

/// Counters updated on every newly recorded heap object.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStats {
    pub count: u64,
    pub large_count: u64,
    pub largest: usize,
}

impl AllocationStats {
    /// Accounts for a heap object that was not tracked before.
    pub fn observe_new(&mut self, size: usize) {
        self.count += 1;
        if size >= LARGE_OBJECT_THRESHOLD {
            self.large_count += 1;
        }
        self.observe_resize(size);
    }

    /// Accounts for a tracked object whose size changed in place.
    pub fn observe_resize(&mut self, size: usize) {
        self.largest = self.largest.max(size);
    }
}

/// Running aggregate of resolved shared array sizes.
///
/// Only count, sum and maximum are kept so memory use does not grow with the
/// number of observations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArrayStats {
    pub count: u64,
    pub sum: u128,
    pub largest: usize,
}

impl ArrayStats {
    pub fn observe(&mut self, size: usize) {
        self.count += 1;
        self.sum += size as u128;
        self.largest = self.largest.max(size);
    }
}

/// Point-in-time copy of every statistic, used for reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatSnapshot {
    pub allocation_count: u64,
    pub large_object_count: u64,
    pub largest_object_size: usize,
    pub largest_array_size: usize,
    pub sum_of_observed_array_sizes: u128,
    pub observed_array_count: u64,
}

impl StatSnapshot {
    pub fn new(allocations: AllocationStats, arrays: ArrayStats) -> Self {
        Self {
            allocation_count: allocations.count,
            large_object_count: allocations.large_count,
            largest_object_size: allocations.largest,
            largest_array_size: arrays.largest,
            sum_of_observed_array_sizes: arrays.sum,
            observed_array_count: arrays.count,
        }
    }

    /// Fraction of allocations that were large, or `None` without allocations.
    pub fn large_fraction(&self) -> Option<f64> {
        (self.allocation_count != 0)
            .then(|| self.large_object_count as f64 / self.allocation_count as f64)
    }
}
