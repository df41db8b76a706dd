//! Core Allocator - Page Source for the Whole Heap
//!
//! Single source of raw memory for the small- and large-object allocators.
//! Returned blocks are cached by size and handed out again before new pages
//! are mapped. The core allocator also owns the heap-size accounting the
//! collector's initiation policy reads:
//!
//! - `heap_size` - bytes currently handed out to allocators
//! - `heap_limit` - growth past it fails with `HeapLimitExceeded`
//! - `max_heap_size` - cap for `expand_heap`

use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{GcError, Result};
use crate::heap::sys::{align_to_page, PageBlock};

struct CoreState {
    cache: IndexMap<usize, Vec<PageBlock>>,
    cached_bytes: usize,
    heap_limit: usize,
}

/// CoreAllocator - page-granular allocator with a block cache
pub struct CoreAllocator {
    state: Mutex<CoreState>,
    heap_size: AtomicUsize,
    heap_limit: AtomicUsize,
    max_heap_size: usize,
}

impl CoreAllocator {
    /// Create allocator with an initial heap limit and a hard maximum
    pub fn new(heap_limit: usize, max_heap_size: usize) -> Self {
        let heap_limit = heap_limit.min(max_heap_size);
        Self {
            state: Mutex::new(CoreState {
                cache: IndexMap::new(),
                cached_bytes: 0,
                heap_limit,
            }),
            heap_size: AtomicUsize::new(0),
            heap_limit: AtomicUsize::new(heap_limit),
            max_heap_size,
        }
    }

    /// Allocate a zeroed block of at least `size` bytes
    ///
    /// # Returns
    /// `HeapLimitExceeded` if the heap would grow past its limit
    pub fn allocate(&self, size: usize) -> Result<PageBlock> {
        let mut state = self.state.lock();
        let size = if size > self.max_heap_size {
            size
        } else {
            align_to_page(size)
        };

        let heap_size = self.heap_size.load(Ordering::Relaxed);
        if size > self.max_heap_size || heap_size + size > state.heap_limit {
            return Err(GcError::HeapLimitExceeded {
                requested: size,
                limit: state.heap_limit,
            });
        }

        let cached = state.cache.get_mut(&size).and_then(|blocks| blocks.pop());
        let block = match cached {
            Some(mut block) => {
                state.cached_bytes -= block.len();
                block.zero();
                block
            }
            None => PageBlock::map(size)?,
        };

        self.heap_size.fetch_add(block.len(), Ordering::Relaxed);
        Ok(block)
    }

    /// Return a block to the cache
    pub fn deallocate(&self, block: PageBlock) {
        let mut state = self.state.lock();
        self.heap_size.fetch_sub(block.len(), Ordering::Relaxed);
        state.cached_bytes += block.len();
        state.cache.entry(block.len()).or_default().push(block);
    }

    /// Unmap every cached block
    ///
    /// # Returns
    /// Number of bytes given back to the OS
    pub fn shrink(&self) -> usize {
        let mut state = self.state.lock();
        let released = state.cached_bytes;
        state.cache.clear();
        state.cached_bytes = 0;
        if released > 0 {
            log::debug!("core allocator released {} cached bytes", released);
        }
        released
    }

    /// Double the heap limit, capped at the maximum heap size
    ///
    /// # Returns
    /// true if the limit grew
    pub fn expand_heap(&self) -> bool {
        let mut state = self.state.lock();
        let old = state.heap_limit;
        let new = old.saturating_mul(2).min(self.max_heap_size);
        if new == old {
            return false;
        }
        state.heap_limit = new;
        self.heap_limit.store(new, Ordering::Relaxed);
        log::warn!("heap limit expanded from {} to {} bytes", old, new);
        true
    }

    /// Set the heap limit, capped at the maximum heap size
    pub fn set_heap_limit(&self, limit: usize) {
        let mut state = self.state.lock();
        let limit = limit.min(self.max_heap_size);
        state.heap_limit = limit;
        self.heap_limit.store(limit, Ordering::Relaxed);
    }

    /// Bytes currently handed out
    pub fn heap_size(&self) -> usize {
        self.heap_size.load(Ordering::Relaxed)
    }

    pub fn heap_limit(&self) -> usize {
        self.heap_limit.load(Ordering::Relaxed)
    }

    pub fn max_heap_size(&self) -> usize {
        self.max_heap_size
    }

    /// Bytes held in the cache
    pub fn cached_bytes(&self) -> usize {
        self.state.lock().cached_bytes
    }

    /// Heap size as a fraction of the heap limit
    pub fn occupancy(&self) -> f64 {
        let limit = self.heap_limit();
        if limit == 0 {
            return 1.0;
        }
        self.heap_size() as f64 / limit as f64
    }
}

impl std::fmt::Debug for CoreAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreAllocator")
            .field("heap_size", &self.heap_size())
            .field("heap_limit", &self.heap_limit())
            .field("max_heap_size", &self.max_heap_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::sys::page_size;

    #[test]
    fn test_allocate_respects_limit() {
        let page = page_size();
        let core = CoreAllocator::new(2 * page, 8 * page);

        let a = core.allocate(page).unwrap();
        let b = core.allocate(page).unwrap();
        assert_eq!(core.heap_size(), 2 * page);
        assert!(matches!(
            core.allocate(page),
            Err(GcError::HeapLimitExceeded { .. })
        ));

        core.deallocate(a);
        core.deallocate(b);
        assert_eq!(core.heap_size(), 0);
    }

    #[test]
    fn test_allocate_beyond_address_space_fails() {
        let page = page_size();
        let core = CoreAllocator::new(page, 2 * page);

        assert!(matches!(
            core.allocate(usize::MAX),
            Err(GcError::HeapLimitExceeded { .. })
        ));
        assert_eq!(core.heap_size(), 0);
    }

    #[test]
    fn test_cached_block_is_reused_and_zeroed() {
        let page = page_size();
        let core = CoreAllocator::new(4 * page, 4 * page);

        let block = core.allocate(page).unwrap();
        let base = block.base();
        unsafe { block.as_ptr().write(0xAB) };
        core.deallocate(block);
        assert_eq!(core.cached_bytes(), page);

        let again = core.allocate(page).unwrap();
        assert_eq!(again.base(), base);
        assert_eq!(unsafe { again.as_ptr().read() }, 0);
        assert_eq!(core.cached_bytes(), 0);
        core.deallocate(again);
    }

    #[test]
    fn test_shrink_reports_released_bytes() {
        let page = page_size();
        let core = CoreAllocator::new(4 * page, 4 * page);
        let block = core.allocate(2 * page).unwrap();
        core.deallocate(block);
        assert_eq!(core.shrink(), 2 * page);
        assert_eq!(core.shrink(), 0);
    }

    #[test]
    fn test_expand_heap_is_capped() {
        let page = page_size();
        let core = CoreAllocator::new(page, 3 * page);
        assert!(core.expand_heap());
        assert_eq!(core.heap_limit(), 2 * page);
        assert!(core.expand_heap());
        assert_eq!(core.heap_limit(), 3 * page);
        assert!(!core.expand_heap());
    }
}
