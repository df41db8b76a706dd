//! System Allocator - OS Page Blocks
//!
//! Thin wrapper around anonymous memory maps. A `PageBlock` owns one
//! page-aligned mapping; dropping it unmaps the memory.

use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{GcError, Result};
use crate::util::Alignment;

/// OS page size in bytes
pub fn page_size() -> usize {
    page_size::get()
}

/// Round `size` up to a whole number of OS pages
pub fn align_to_page(size: usize) -> usize {
    Alignment::align_up(size.max(1), page_size())
}

/// Page-aligned block of anonymous memory
pub struct PageBlock {
    ptr: NonNull<u8>,
    map: MmapMut,
}

// The block exclusively owns its mapping.
unsafe impl Send for PageBlock {}
unsafe impl Sync for PageBlock {}

impl PageBlock {
    /// Map a fresh zeroed block of at least `size` bytes
    pub fn map(size: usize) -> Result<Self> {
        let len = align_to_page(size);
        let mut map = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|source| GcError::SystemCall {
                call: "mmap",
                source,
            })?;
        let ptr = NonNull::new(map.as_mut_ptr()).ok_or(GcError::OutOfMemory {
            requested: len,
            available: 0,
        })?;
        Ok(Self { ptr, map })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.len()
    }

    /// Zero the whole block
    pub fn zero(&mut self) {
        self.map.fill(0);
    }
}

impl std::fmt::Debug for PageBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBlock")
            .field("base", &self.ptr)
            .field("len", &self.len())
            .finish()
    }
}
