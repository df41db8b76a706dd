//! Forwarding - Moved Object Table
//!
//! Records "object at A moved to B" for one collection. The mapping itself
//! is stored in the header of the vacated cell, so a lookup is one index
//! query plus one header read.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::index::{GcCell, MemoryIndex};
use crate::object::{gc_box, GcHandle};

/// Forwarding - relocation records of one collection
pub struct Forwarding {
    index: Arc<MemoryIndex>,
    entries: AtomicUsize,
    bytes_copied: AtomicUsize,
}

impl Forwarding {
    pub fn new(index: Arc<MemoryIndex>) -> Self {
        Self {
            index,
            entries: AtomicUsize::new(0),
            bytes_copied: AtomicUsize::new(0),
        }
    }

    /// Move the cell `from` into `to` and record the move
    ///
    /// Copies the whole cell (header and objects). Mark, pin and init bits
    /// are left to the caller.
    pub fn create(&self, from: GcCell, to: GcCell) {
        let size = from.cell_size();
        debug_assert_eq!(size, to.cell_size(), "cells of different size classes");
        debug_assert_ne!(from.cell_start(), to.cell_start());

        // SAFETY: both cells belong to the same chunk size class and do not
        // overlap; the world is stopped.
        unsafe {
            gc_box::move_cell(from.cell_start(), to.cell_start(), size);
            gc_box::set_forward_pointer(from.cell_start(), to.cell_start());
        }

        self.entries.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(size, Ordering::Relaxed);
    }

    /// Point `handle` at the new location of its target, if it moved
    ///
    /// Interior offsets are preserved. A handle already pointing at a new
    /// location is left untouched.
    pub fn forward(&self, handle: &GcHandle) {
        let ptr = handle.get();
        if ptr.is_null() {
            return;
        }
        let cell = match self.index.get_cell(ptr) {
            Some(cell) => cell,
            None => return,
        };

        // SAFETY: `cell` resolves to a heap cell with a header.
        if let Some(to) = unsafe { gc_box::forward_pointer(cell.cell_start()) } {
            let offset = ptr as usize - cell.cell_start() as usize;
            handle.store(to.wrapping_add(offset), Ordering::Release);
        }
    }

    /// Forward a raw pointer
    pub fn forward_ptr(&self, ptr: *mut u8) -> *mut u8 {
        let handle = GcHandle::new(ptr);
        self.forward(&handle);
        handle.get()
    }

    /// Number of moves recorded
    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn bytes_copied(&self) -> usize {
        self.bytes_copied.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Forwarding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarding")
            .field("entries", &self.entries())
            .field("bytes_copied", &self.bytes_copied())
            .finish()
    }
}
