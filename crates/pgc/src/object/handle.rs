//! GcHandle - Managed Reference Slot
//!
//! Every managed reference stored in a root, a pinned slot or an object
//! field is a `GcHandle`. Handles are atomic so that marker threads can
//! read them while mutators store through the write barrier.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Atomic slot holding a pointer into the managed heap (or null)
#[repr(transparent)]
pub struct GcHandle {
    ptr: AtomicPtr<u8>,
}

impl GcHandle {
    /// Null handle
    pub const fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Handle pointing at `ptr`
    pub fn new(ptr: *mut u8) -> Self {
        Self {
            ptr: AtomicPtr::new(ptr),
        }
    }

    /// Load the pointer with the given ordering
    #[inline]
    pub fn load(&self, order: Ordering) -> *mut u8 {
        self.ptr.load(order)
    }

    /// Store a pointer with the given ordering
    #[inline]
    pub fn store(&self, ptr: *mut u8, order: Ordering) {
        self.ptr.store(ptr, order)
    }

    /// Acquire-load of the current pointer
    #[inline]
    pub fn get(&self) -> *mut u8 {
        self.load(Ordering::Acquire)
    }

    /// Check if the handle is null
    pub fn is_null(&self) -> bool {
        self.get().is_null()
    }

    /// Address of the slot itself
    pub fn address(&self) -> usize {
        self as *const GcHandle as usize
    }

    /// Reinterpret a slot address as a handle
    ///
    /// # Safety
    /// `addr` must point to a live, 8-byte aligned `GcHandle` for `'a`.
    #[inline]
    pub unsafe fn from_address<'a>(addr: usize) -> &'a GcHandle {
        &*(addr as *const GcHandle)
    }
}

impl Default for GcHandle {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Debug for GcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcHandle({:p})", self.get())
    }
}
