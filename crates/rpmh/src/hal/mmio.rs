//! Memory-mapped register bus
//!
//! All accesses are volatile so the compiler never merges, reorders or elides
//! device register traffic.

use super::RegisterBus;
use std::ptr::{read_volatile, write_volatile};

/// A mapped RSC register window
#[derive(Debug, Clone, Copy)]
pub struct MmioBus {
    base: usize,
    size: usize,
}

impl MmioBus {
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `base` points to a mapped region of at least `size` bytes
    /// - the mapping has device (non-cacheable) attributes, or is plain memory
    /// - the region outlives every use of this bus
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> usize {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

impl RegisterBus for MmioBus {
    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size, "MMIO read32 offset out of bounds");
        debug_assert!(offset % 4 == 0, "MMIO read32 offset not aligned");
        // SAFETY: construction guarantees the window is mapped; offset is in bounds
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size, "MMIO write32 offset out of bounds");
        debug_assert!(offset % 4 == 0, "MMIO write32 offset not aligned");
        // SAFETY: construction guarantees the window is mapped; offset is in bounds
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}
