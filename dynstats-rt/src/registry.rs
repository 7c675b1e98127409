//! Live heap range registry.
//!
//! Records the address range of every live heap object and resolves an
//! arbitrary pointer, including interior pointers, to the object that contains
//! it. Ranges are keyed by their start address, so lookups are floor queries on
//! an ordered map.
use std::collections::BTreeMap;
use tracing::warn;

/// Ordered map of live allocations.
///
/// The registry itself is not synchronized. [`crate::Runtime`] wraps it in its
/// own lock.
#[derive(Debug, Default)]
pub struct RangeRegistry {
    /// Map from allocation start address to its exclusive end address
    ranges: BTreeMap<usize, usize>,
}

impl RangeRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an allocation of `size` bytes starting at `start`.
    ///
    /// A null `start` means the allocator failed and nothing is recorded.
    /// Recording an already known start overwrites its end address.
    ///
    /// The exclusive end is clamped to `usize::MAX`, so a range reaching the
    /// top of the address space never covers its last byte.
    ///
    /// # Returns
    /// * `true` - If a new range was created
    /// * `false` - If `start` was null or an existing range was overwritten
    pub fn record(&mut self, start: usize, size: usize) -> bool {
        if start == 0 {
            return false;
        }
        let end = start.saturating_add(size);
        if cfg!(debug_assertions) && self.has_overlap(start, end) {
            warn!(
                "Allocation at 0x{:x} (size {}) overlaps with a live range",
                start, size
            );
        }
        self.ranges.insert(start, end).is_none()
    }

    /// Removes the range starting at `start`, if any.
    ///
    /// Removing an unknown address is a no-op.
    ///
    /// # Returns
    /// The size of the removed range, if there was one.
    pub fn remove(&mut self, start: usize) -> Option<usize> {
        self.ranges.remove(&start).map(|end| end - start)
    }

    /// Resolves `ptr` to the number of bytes left in the allocation holding it.
    ///
    /// The floor entry covers an exact start match, an interior pointer of
    /// some predecessor and a pointer past the last recorded start. Either
    /// way the pointer only matches if it is below that range's end.
    ///
    /// # Returns
    /// * `Some(size)` - `end - ptr` of the containing range
    /// * `None` - If no live range contains `ptr`
    pub fn resolve(&self, ptr: usize) -> Option<usize> {
        let (_, &end) = self.ranges.range(..=ptr).next_back()?;
        (ptr < end).then(|| end - ptr)
    }

    /// Checks whether `ptr` falls inside some live range.
    pub fn contains(&self, ptr: usize) -> bool {
        self.resolve(ptr).is_some()
    }

    /// Returns the size of the range starting exactly at `start`.
    pub fn size_of(&self, start: usize) -> Option<usize> {
        self.ranges.get(&start).map(|end| end - start)
    }

    /// Number of live ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Checks `[start, end)` against its direct neighbours.
    ///
    /// Live ranges are disjoint, so only the floor entry and the first entry
    /// after `start` can intersect the new range.
    fn has_overlap(&self, start: usize, end: usize) -> bool {
        let before = self
            .ranges
            .range(..start)
            .next_back()
            .is_some_and(|(_, &prev_end)| prev_end > start);
        let after = self
            .ranges
            .range(start.saturating_add(1)..)
            .next()
            .is_some_and(|(&next_start, _)| next_start < end);
        before || after
    }
}
