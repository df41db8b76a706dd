//! Large Object Allocator
//!
//! Objects whose cell exceeds `LARGE_CELL_SIZE` get a dedicated,
//! page-granular block. Large objects are swept, never compacted.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::{AllocRequest, AllocResponse};
use crate::error::Result;
use crate::heap::core::CoreAllocator;
use crate::heap::sys::PageBlock;
use crate::index::{MemoryDescriptor, MemoryIndex, MemoryKind, MemoryRef};
use crate::object::{gc_box, GcHandle, TypeMeta};
use crate::relocate::Forwarding;
use crate::stats::HeapStat;

/// Descriptor of one large object
pub struct LargeDescriptor {
    block: PageBlock,
    mark: AtomicBool,
    pin: AtomicBool,
    init: AtomicBool,
}

impl LargeDescriptor {
    fn new(block: PageBlock) -> Self {
        Self {
            block,
            mark: AtomicBool::new(false),
            pin: AtomicBool::new(false),
            init: AtomicBool::new(false),
        }
    }

    pub fn base(&self) -> usize {
        self.block.base()
    }

    pub fn size(&self) -> usize {
        self.block.len()
    }

    fn cell(&self) -> *mut u8 {
        self.block.as_ptr()
    }

    fn owns(&self, ptr: *mut u8) -> bool {
        self.block.contains(ptr as usize)
    }
}

impl MemoryDescriptor for LargeDescriptor {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Heap
    }

    fn cell_start(&self, ptr: *mut u8) -> *mut u8 {
        if self.owns(ptr) {
            self.cell()
        } else {
            ptr::null_mut()
        }
    }

    fn cell_size(&self, _ptr: *mut u8) -> usize {
        self.size()
    }

    fn object_count(&self, _ptr: *mut u8) -> usize {
        // SAFETY: the block always starts with a header.
        unsafe { gc_box::object_count(self.cell()) }
    }

    fn type_meta(&self, _ptr: *mut u8) -> Option<&'static TypeMeta> {
        if !self.init.load(Ordering::Acquire) {
            return None;
        }
        unsafe { gc_box::type_meta(self.cell()) }
    }

    fn get_mark(&self, _ptr: *mut u8) -> bool {
        self.mark.load(Ordering::Acquire)
    }

    fn set_mark(&self, _ptr: *mut u8, mark: bool) {
        self.mark.store(mark, Ordering::Release)
    }

    fn mark(&self, _ptr: *mut u8) -> bool {
        self.mark.swap(true, Ordering::AcqRel)
    }

    fn get_pin(&self, _ptr: *mut u8) -> bool {
        self.pin.load(Ordering::Acquire)
    }

    fn set_pin(&self, _ptr: *mut u8, pin: bool) {
        self.pin.store(pin, Ordering::Release)
    }

    fn is_init(&self, _ptr: *mut u8) -> bool {
        self.init.load(Ordering::Acquire)
    }

    fn commit(&self, _ptr: *mut u8) {
        self.init.store(true, Ordering::Release)
    }

    fn commit_with_meta(&self, _ptr: *mut u8, meta: &'static TypeMeta) {
        unsafe { gc_box::set_type_meta(self.cell(), meta) };
        self.init.store(true, Ordering::Release)
    }

    fn trace(&self, _ptr: *mut u8, f: &mut dyn FnMut(&GcHandle)) {
        if self.init.load(Ordering::Acquire) {
            unsafe { gc_box::trace(self.cell(), f) };
        }
    }

    fn finalize(&self, _ptr: *mut u8) {
        self.init.store(false, Ordering::Release);
        self.mark.store(false, Ordering::Release);
        self.pin.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for LargeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeDescriptor")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size())
            .finish()
    }
}

/// LargeObjectAllocator - one block per object, shared by all threads
pub struct LargeObjectAllocator {
    objects: Mutex<Vec<Box<LargeDescriptor>>>,
    index: Arc<MemoryIndex>,
    core: Arc<CoreAllocator>,
}

impl LargeObjectAllocator {
    pub fn new(index: Arc<MemoryIndex>, core: Arc<CoreAllocator>) -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
            index,
            core,
        }
    }

    /// Allocate a dedicated block for `req`
    pub fn allocate(&self, req: &AllocRequest) -> Result<AllocResponse> {
        let block = self.core.allocate(req.box_size()?)?;
        let desc = Box::new(LargeDescriptor::new(block));
        let memory = MemoryRef::large(&desc);

        if let Err(err) = self.index.index(desc.base(), desc.size(), memory) {
            self.core.deallocate(desc.block);
            return Err(err);
        }

        // SAFETY: the block is fresh, zeroed and large enough for a header.
        unsafe { gc_box::init(desc.cell(), req.count, req.meta) };
        let response = AllocResponse::new(memory, desc.cell(), desc.size());
        self.objects.lock().push(desc);
        Ok(response)
    }

    fn destroy(&self, desc: Box<LargeDescriptor>) {
        if let Err(err) = self.index.deindex(desc.base(), desc.size()) {
            log::error!("failed to deindex large object {:#x}: {}", desc.base(), err);
        }
        self.core.deallocate(desc.block);
    }

    /// Free every unmarked object
    pub fn collect(&self) -> HeapStat {
        let mut stat = HeapStat::default();
        let mut objects = self.objects.lock();

        for desc in std::mem::take(&mut *objects) {
            let cell = desc.cell();
            stat.mem_before_gc += desc.size();
            if desc.get_mark(cell) {
                stat.mem_occupied += desc.size();
                stat.mem_live += desc.size();
                if desc.get_pin(cell) {
                    stat.pinned_count += 1;
                }
                objects.push(desc);
            } else {
                stat.mem_freed += desc.size();
                desc.finalize(cell);
                self.destroy(desc);
            }
        }

        log::trace!(
            "large objects collected: live={} freed={}",
            stat.mem_live,
            stat.mem_freed
        );
        stat
    }

    /// Forward every handle held by live large objects
    pub fn fix(&self, forwarding: &Forwarding) {
        for desc in self.objects.lock().iter() {
            desc.trace(desc.cell(), &mut |handle| forwarding.forward(handle));
        }
    }

    /// Clear mark and pin flags
    pub fn finalize(&self) {
        for desc in self.objects.lock().iter() {
            desc.mark.store(false, Ordering::Release);
            desc.pin.store(false, Ordering::Release);
        }
    }

    /// Number of live large objects
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Bytes owned by large objects
    pub fn occupied(&self) -> usize {
        self.objects.lock().iter().map(|desc| desc.size()).sum()
    }
}

impl Drop for LargeObjectAllocator {
    fn drop(&mut self) {
        for desc in std::mem::take(&mut *self.objects.lock()) {
            self.destroy(desc);
        }
    }
}

impl std::fmt::Debug for LargeObjectAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeObjectAllocator")
            .field("objects", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::LARGE_CELL_SIZE;
    use crate::config::MB;

    fn loa() -> LargeObjectAllocator {
        LargeObjectAllocator::new(
            Arc::new(MemoryIndex::new()),
            Arc::new(CoreAllocator::new(16 * MB, 16 * MB)),
        )
    }

    #[test]
    fn test_interior_pointer_resolves_to_object() {
        let loa = loa();
        let response = loa.allocate(&AllocRequest::raw(3 * LARGE_CELL_SIZE)).unwrap();
        let interior = unsafe { response.ptr.add(2 * LARGE_CELL_SIZE) };

        let cell = loa.index.get_cell(interior).unwrap();
        assert_eq!(cell.cell_start(), response.cell_start);
        assert!(cell.cell_size() >= 3 * LARGE_CELL_SIZE);
    }

    #[test]
    fn test_collect_marked_pinned_and_dead() {
        // Arrange
        let loa = loa();
        let objects: Vec<_> = (0..3)
            .map(|_| loa.allocate(&AllocRequest::raw(2 * LARGE_CELL_SIZE)).unwrap())
            .collect();
        let size = objects[0].cell_size;

        objects[0].cell().set_mark(true);
        objects[0].cell().set_pin(true);
        objects[2].cell().set_mark(true);

        // Act
        let stat = loa.collect();

        // Assert
        assert_eq!(stat.mem_freed, size);
        assert_eq!(stat.mem_live, 2 * size);
        assert_eq!(stat.pinned_count, 1);
        assert_eq!(loa.len(), 2);
        assert!(loa.index.lookup(objects[1].cell_start as usize).is_none());
    }
}
