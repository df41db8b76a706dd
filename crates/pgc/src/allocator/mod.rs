//! Allocator Module - Small and Large Object Allocation
//!
//! Two allocators sit on top of the core allocator:
//!
//! ```text
//!                 AllocRequest { size, count, meta }
//!                              |
//!              box_size <= LARGE_CELL_SIZE ?
//!                 /                         \
//!     SmallObjectAllocator (TLAB)     LargeObjectAllocator (shared)
//!     one PoolAllocator per bucket    one block per object
//!        chunks of fixed cells
//!                 \                         /
//!                       CoreAllocator
//! ```
//!
//! Every chunk and every large block is indexed in the memory index for its
//! whole lifetime, so any interior pointer resolves to its cell.

pub mod bucket;
pub mod large;
pub mod pool;
pub mod small;

pub use bucket::{bucket_index, LARGE_CELL_SIZE, MIN_CELL_SIZE};
pub use large::{LargeDescriptor, LargeObjectAllocator};
pub use pool::{PoolAllocator, PoolDescriptor};
pub use small::SmallObjectAllocator;

use crate::error::{GcError, Result};
use crate::index::{GcCell, MemoryRef};
use crate::object::gc_box;
use crate::object::TypeMeta;

/// Allocation request for `count` objects of `size` bytes each
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    pub size: usize,
    pub count: usize,
    pub meta: Option<&'static TypeMeta>,
}

impl AllocRequest {
    /// Request a single object described by `meta`
    pub fn of(meta: &'static TypeMeta) -> Self {
        Self {
            size: meta.size(),
            count: 1,
            meta: Some(meta),
        }
    }

    /// Request an array of `count` objects described by `meta`
    pub fn array(meta: &'static TypeMeta, count: usize) -> Self {
        Self {
            size: meta.size(),
            count,
            meta: Some(meta),
        }
    }

    /// Request `size` bytes of untyped memory
    pub fn raw(size: usize) -> Self {
        Self {
            size,
            count: 1,
            meta: None,
        }
    }

    /// Cell bytes needed including the box header
    ///
    /// # Errors
    /// `InvalidArgument` if the request does not fit in the address space
    pub fn box_size(&self) -> Result<usize> {
        gc_box::box_size(self.size, self.count).ok_or_else(|| {
            GcError::InvalidArgument(format!(
                "{} objects of {} bytes overflow the address space",
                self.count, self.size
            ))
        })
    }
}

/// Result of a successful allocation
#[derive(Debug, Clone, Copy)]
pub struct AllocResponse {
    /// Start of the first object
    pub ptr: *mut u8,
    pub cell_start: *mut u8,
    pub cell_size: usize,
    pub memory: MemoryRef,
}

impl AllocResponse {
    pub(crate) fn new(memory: MemoryRef, cell_start: *mut u8, cell_size: usize) -> Self {
        Self {
            ptr: gc_box::object_start(cell_start),
            cell_start,
            cell_size,
            memory,
        }
    }

    /// The allocated cell
    pub fn cell(&self) -> GcCell {
        GcCell::new(self.memory, self.cell_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PAIR: TypeMeta = TypeMeta::new("Pair", 16, &[0, 8]);

    #[test]
    fn test_request_box_size() {
        assert_eq!(AllocRequest::of(&PAIR).box_size().unwrap(), gc_box::HEADER_SIZE + 16);
        assert_eq!(
            AllocRequest::array(&PAIR, 4).box_size().unwrap(),
            gc_box::HEADER_SIZE + 64
        );
        assert_eq!(AllocRequest::raw(5).box_size().unwrap(), gc_box::HEADER_SIZE + 8);
    }

    #[test]
    fn test_oversized_array_request_is_rejected() {
        let req = AllocRequest::array(&PAIR, usize::MAX / 8);
        assert!(matches!(req.box_size(), Err(GcError::InvalidArgument(_))));
    }
}
