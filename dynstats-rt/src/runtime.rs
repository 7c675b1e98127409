//! The runtime context shared by every hook.
//!
//! A [`Runtime`] is created when the instrumented process starts, mutated only
//! through the [`HookSink`] operations and flushed once at normal exit. Each
//! piece of state sits behind its own lock and no operation holds two of them
//! at the same time, so hooks from different threads only contend when they
//! touch the same state.

use crate::config::RuntimeConfig;
use crate::registry::RangeRegistry;
use crate::report::{self, ReportSink};
use crate::stats::{AllocationStats, ArrayStats, StatSnapshot};
use anyhow::Result;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// The operations of the hook ABI.
///
/// Addresses are plain integers; `0` is the null pointer.
pub trait HookSink {
    /// An allocation of `size` bytes returned `addr`.
    fn record_allocation(&self, addr: usize, size: usize);

    /// A reallocation of `old_addr` to `size` bytes returned `new_addr`.
    fn record_reallocation(&self, old_addr: usize, new_addr: usize, size: usize);

    /// The object starting at `addr` was freed.
    fn remove_range(&self, addr: usize);

    /// `addr` was handed to a library as an array of pointers.
    fn resolve_array_size(&self, addr: usize);

    /// Normal process exit.
    fn dump_summary(&self);
}

#[derive(Debug)]
pub struct Runtime {
    registry: Mutex<RangeRegistry>,
    allocations: Mutex<AllocationStats>,
    arrays: Mutex<ArrayStats>,
    output: Mutex<ReportSink>,
}

/// Locks `mutex`, recovering the data if a previous holder panicked.
///
/// Every critical section leaves the guarded value consistent between
/// statements, so a poisoned lock still holds usable data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            registry: Mutex::new(RangeRegistry::new()),
            allocations: Mutex::new(AllocationStats::default()),
            arrays: Mutex::new(ArrayStats::default()),
            output: Mutex::new(ReportSink::new(config)),
        }
    }

    /// Records a live range and updates the allocation statistics.
    ///
    /// A null `start` is a failed allocation and changes nothing.
    pub fn record(&self, start: usize, size: usize) {
        if start == 0 {
            trace!("Ignoring failed allocation of {} bytes", size);
            return;
        }
        trace!("Adding range 0x{:x} - 0x{:x}", start, start.saturating_add(size));
        let is_new = lock(&self.registry).record(start, size);

        let mut allocations = lock(&self.allocations);
        if is_new {
            allocations.observe_new(size);
        } else {
            allocations.observe_resize(size);
        }
    }

    /// Applies a reallocation from `old` to `new`.
    pub fn record_reallocation(&self, old: usize, new: usize, size: usize) {
        if old == 0 {
            self.record(new, size);
        } else if size == 0 {
            self.remove(old);
        } else if new != 0 {
            if new != old {
                self.remove(old);
            }
            self.record(new, size);
        } else {
            trace!("Reallocation of 0x{:x} failed, keeping the old range", old);
        }
    }

    /// Forgets the range starting at `start`, if any.
    pub fn remove(&self, start: usize) {
        let removed = lock(&self.registry).remove(start);
        trace!("Removing range at 0x{:x}: {:?}", start, removed);
    }

    /// Resolves `ptr` to the remaining size of its allocation.
    ///
    /// A hit is added to the shared array statistics; a miss is returned as
    /// `None` and not counted.
    pub fn resolve(&self, ptr: usize) -> Option<usize> {
        let size = lock(&self.registry).resolve(ptr);
        match size {
            Some(size) => {
                trace!("Found addr = 0x{:x}, size = {}", ptr, size);
                lock(&self.arrays).observe(size);
            }
            None => trace!("No live range contains 0x{:x}", ptr),
        }
        size
    }

    /// Number of live ranges.
    pub fn live_ranges(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn snapshot(&self) -> StatSnapshot {
        let allocations = *lock(&self.allocations);
        let arrays = *lock(&self.arrays);
        StatSnapshot::new(allocations, arrays)
    }

    /// Renders the current statistics and writes them to the report file.
    pub fn flush(&self) -> Result<()> {
        let text = report::render(&self.snapshot());
        let mut output = lock(&self.output);
        debug!("Writing summary to {}", output.config().report_path().display());
        output.write(&text)
    }
}

impl HookSink for Runtime {
    fn record_allocation(&self, addr: usize, size: usize) {
        self.record(addr, size);
    }

    fn record_reallocation(&self, old_addr: usize, new_addr: usize, size: usize) {
        Runtime::record_reallocation(self, old_addr, new_addr, size);
    }

    fn remove_range(&self, addr: usize) {
        self.remove(addr);
    }

    fn resolve_array_size(&self, addr: usize) {
        self.resolve(addr);
    }

    fn dump_summary(&self) {
        if let Err(err) = self.flush() {
            tracing::error!("Failed to write summary: {:#}", err);
            if cfg!(debug_assertions) {
                eprintln!("dynstats: failed to write summary: {err:#}");
            }
        }
    }
}
