//! Simulated heap backing the allocation functions of interpreted programs.
//!
//! Only addresses and sizes are modeled, there is no memory content. Addresses
//! grow monotonically so that a freed address is never handed out again.

use anyhow::{Result, bail};
use std::collections::BTreeMap;
use tracing::debug;

/// First address handed out.
pub const HEAP_BASE: u64 = 0x1000_0000;

/// Alignment of every allocation.
pub const HEAP_ALIGN: u64 = 16;

#[derive(Debug)]
pub struct SimHeap {
    next_address: u64,
    /// Start address to size of every live allocation
    live: BTreeMap<u64, u64>,
}

impl Default for SimHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHeap {
    pub fn new() -> Self {
        Self {
            next_address: HEAP_BASE,
            live: BTreeMap::new(),
        }
    }

    /// Allocates `size` bytes. Returns 0 if the address space is exhausted.
    ///
    /// A zero-sized allocation still gets a unique address.
    pub fn malloc(&mut self, size: u64) -> u64 {
        let footprint = size.max(1).div_ceil(HEAP_ALIGN).saturating_mul(HEAP_ALIGN);
        let Some(end) = self.next_address.checked_add(footprint) else {
            return 0;
        };
        let address = self.next_address;
        self.next_address = end;
        self.live.insert(address, size);
        debug!("malloc({}) = {:#x}", size, address);
        address
    }

    /// Allocates `count * size` bytes. Returns 0 on overflow.
    pub fn calloc(&mut self, count: u64, size: u64) -> u64 {
        match count.checked_mul(size) {
            Some(total) => self.malloc(total),
            None => 0,
        }
    }

    /// Resizes the allocation at `address`.
    ///
    /// Shrinking keeps the allocation in place, growing moves it. A zero size
    /// frees `address` and returns 0.
    pub fn realloc(&mut self, address: u64, size: u64) -> Result<u64> {
        if address == 0 {
            return Ok(self.malloc(size));
        }
        let Some(old_size) = self.live.get(&address).copied() else {
            bail!("realloc of unknown pointer {:#x}", address);
        };
        if size == 0 {
            self.live.remove(&address);
            return Ok(0);
        }
        if size <= old_size {
            self.live.insert(address, size);
            return Ok(address);
        }
        let new_address = self.malloc(size);
        if new_address != 0 {
            self.live.remove(&address);
        }
        Ok(new_address)
    }

    /// `realloc(address, count * size)`, failing with 0 on overflow.
    pub fn reallocarray(&mut self, address: u64, count: u64, size: u64) -> Result<u64> {
        match count.checked_mul(size) {
            Some(total) => self.realloc(address, total),
            None => Ok(0),
        }
    }

    /// Releases `address`. Freeing null is a no-op.
    pub fn free(&mut self, address: u64) -> Result<()> {
        if address != 0 && self.live.remove(&address).is_none() {
            bail!("free of unknown pointer {:#x}", address);
        }
        Ok(())
    }

    pub fn size_of(&self, address: u64) -> Option<u64> {
        self.live.get(&address).copied()
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }
}
