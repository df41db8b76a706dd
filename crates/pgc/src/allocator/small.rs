//! Small Object Allocator - Thread-Local Bucket Array
//!
//! One `SmallObjectAllocator` per mutator thread (the TLAB). It owns a
//! `PoolAllocator` per size class, so the allocation fast path never
//! touches memory shared with other mutators.

use std::sync::Arc;

use crate::allocator::bucket::{bucket_cell_size, bucket_index, BUCKET_COUNT};
use crate::allocator::pool::PoolAllocator;
use crate::allocator::{AllocRequest, AllocResponse};
use crate::error::{GcError, Result};
use crate::heap::core::CoreAllocator;
use crate::index::MemoryIndex;
use crate::relocate::Forwarding;
use crate::stats::HeapStat;

/// SmallObjectAllocator - bucketed TLAB
pub struct SmallObjectAllocator {
    buckets: Vec<PoolAllocator>,
}

impl SmallObjectAllocator {
    pub fn new(index: Arc<MemoryIndex>, core: Arc<CoreAllocator>) -> Self {
        let buckets = (0..BUCKET_COUNT)
            .map(|idx| {
                PoolAllocator::new(bucket_cell_size(idx), Arc::clone(&index), Arc::clone(&core))
            })
            .collect();
        Self { buckets }
    }

    /// Allocate a cell from the bucket fitting `req`
    pub fn allocate(&mut self, req: &AllocRequest) -> Result<AllocResponse> {
        let box_size = req.box_size()?;
        let idx = bucket_index(box_size).ok_or_else(|| {
            GcError::InvalidArgument(format!("{} bytes is not a small object", box_size))
        })?;
        self.buckets[idx].allocate(req)
    }

    /// Return the cell containing `ptr` to its bucket
    pub fn deallocate(&mut self, ptr: *mut u8) -> Result<()> {
        let addr = ptr as usize;
        let bucket = self
            .buckets
            .iter_mut()
            .find(|bucket| bucket.contains(addr))
            .ok_or(GcError::InvalidPointer { address: addr })?;
        bucket.deallocate(ptr)
    }

    /// Check if `addr` lies in memory owned by this TLAB
    pub fn contains(&self, addr: usize) -> bool {
        self.buckets.iter().any(|bucket| bucket.contains(addr))
    }

    pub fn buckets(&self) -> &[PoolAllocator] {
        &self.buckets
    }

    pub fn buckets_mut(&mut self) -> &mut [PoolAllocator] {
        &mut self.buckets
    }

    /// Collect every bucket sequentially
    pub fn collect(&mut self, forwarding: &Forwarding, compacting: bool) -> HeapStat {
        self.buckets
            .iter_mut()
            .map(|bucket| bucket.collect(forwarding, compacting))
            .fold(HeapStat::default(), |acc, stat| acc + stat)
    }

    pub fn fix(&self, forwarding: &Forwarding) {
        for bucket in &self.buckets {
            bucket.fix(forwarding);
        }
    }

    pub fn finalize(&self) {
        for bucket in &self.buckets {
            bucket.finalize();
        }
    }

    /// Bytes owned by this TLAB
    pub fn occupied(&self) -> usize {
        self.buckets.iter().map(PoolAllocator::occupied).sum()
    }

    /// Check if no bucket owns any chunk
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(PoolAllocator::is_empty)
    }
}

impl std::fmt::Debug for SmallObjectAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmallObjectAllocator")
            .field("occupied", &self.occupied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::LARGE_CELL_SIZE;
    use crate::config::MB;

    fn tlab() -> SmallObjectAllocator {
        SmallObjectAllocator::new(
            Arc::new(MemoryIndex::new()),
            Arc::new(CoreAllocator::new(16 * MB, 16 * MB)),
        )
    }

    #[test]
    fn test_allocate_picks_bucket_by_size() {
        let mut tlab = tlab();
        let small = tlab.allocate(&AllocRequest::raw(8)).unwrap();
        let medium = tlab.allocate(&AllocRequest::raw(200)).unwrap();
        assert_eq!(small.cell_size, 32);
        assert_eq!(medium.cell_size, 256);
        assert!(tlab.contains(small.ptr as usize));
        assert!(!tlab.is_empty());
    }

    #[test]
    fn test_large_request_is_rejected() {
        let mut tlab = tlab();
        let result = tlab.allocate(&AllocRequest::raw(LARGE_CELL_SIZE));
        assert!(matches!(result, Err(GcError::InvalidArgument(_))));
    }

    #[test]
    fn test_deallocate_foreign_pointer_fails() {
        let mut tlab = tlab();
        let local = 0usize;
        let result = tlab.deallocate(&local as *const usize as *mut u8);
        assert!(matches!(result, Err(GcError::InvalidPointer { .. })));
    }
}
