//! Thread Descriptor - Per-Mutator Record
//!
//! Everything the collector knows about one registered mutator thread:
//!
//! - identity (`ThreadId` and native pthread handle)
//! - stack bounds, indexed as stack memory while the thread is registered
//! - the thread's TLAB (small-object allocator)
//! - registered stack roots, pins, the LIFO pin stack
//! - cells allocated but not yet committed
//! - the store buffer feeding the remembered set
//!
//! Every mutable part sits behind its own lock. The owning thread takes
//! them inside an unsafe scope, the collector takes them with the world
//! stopped, so the locks are never contended while a thread is parked.

use std::thread::ThreadId;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use crate::allocator::SmallObjectAllocator;
use crate::error::{GcError, Result};
use crate::index::{MemoryIndex, MemoryRef, StackDescriptor, INDEX_PAGE_SIZE};
use crate::marker::StoreBuffer;
use crate::object::GcHandle;
use crate::util::Alignment;

/// Stack range of the calling thread as `(low, high)`
#[cfg(any(target_os = "linux", target_os = "android"))]
fn current_stack_bounds() -> Option<(usize, usize)> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        Some((addr as usize, addr as usize + size))
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn current_stack_bounds() -> Option<(usize, usize)> {
    unsafe {
        let thread = libc::pthread_self();
        let high = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        if high == 0 || size == 0 {
            return None;
        }
        Some((high - size, high))
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
fn current_stack_bounds() -> Option<(usize, usize)> {
    None
}

/// Stack of the calling thread, shrunk inward to index page boundaries
fn current_stack() -> Option<StackDescriptor> {
    let (low, high) = current_stack_bounds()?;
    let base = Alignment::align_up(low, INDEX_PAGE_SIZE);
    let end = Alignment::align_down(high, INDEX_PAGE_SIZE);
    if end <= base {
        return None;
    }
    Some(StackDescriptor::new(base, end - base))
}

/// ThreadDescriptor - state of one registered mutator
pub struct ThreadDescriptor {
    id: ThreadId,
    native: usize,
    stack: Option<Box<StackDescriptor>>,
    tlab: Mutex<SmallObjectAllocator>,
    roots: Mutex<IndexSet<usize>>,
    pins: Mutex<IndexMap<usize, usize>>,
    pin_stack: Mutex<Vec<usize>>,
    uninit: Mutex<IndexSet<usize>>,
    store_buffer: Mutex<StoreBuffer>,
}

impl ThreadDescriptor {
    /// Describe the calling thread
    pub(crate) fn current(tlab: SmallObjectAllocator) -> Self {
        Self {
            id: std::thread::current().id(),
            native: unsafe { libc::pthread_self() } as usize,
            stack: current_stack().map(Box::new),
            tlab: Mutex::new(tlab),
            roots: Mutex::new(IndexSet::new()),
            pins: Mutex::new(IndexMap::new()),
            pin_stack: Mutex::new(Vec::new()),
            uninit: Mutex::new(IndexSet::new()),
            store_buffer: Mutex::new(StoreBuffer::new()),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn native(&self) -> libc::pthread_t {
        self.native as libc::pthread_t
    }

    /// Registered stack bounds, if the platform reported them
    pub fn stack(&self) -> Option<&StackDescriptor> {
        self.stack.as_deref()
    }

    /// Index this thread's stack as stack memory
    ///
    /// A failure is logged and the thread stays without indexed stack;
    /// its roots then count as static roots.
    pub(crate) fn index_stack(&mut self, index: &MemoryIndex) {
        if let Some(stack) = self.stack.as_deref() {
            if let Err(err) = index.index(stack.base(), stack.size(), MemoryRef::stack(stack)) {
                log::warn!("stack of {:?} not indexed: {}", self.id, err);
                self.stack = None;
            }
        }
    }

    pub(crate) fn deindex_stack(&self, index: &MemoryIndex) {
        if let Some(stack) = self.stack.as_deref() {
            if let Err(err) = index.deindex(stack.base(), stack.size()) {
                log::error!("failed to deindex stack of {:?}: {}", self.id, err);
            }
        }
    }

    pub(crate) fn tlab(&self) -> &Mutex<SmallObjectAllocator> {
        &self.tlab
    }

    /// Move the TLAB out, leaving an empty allocator in its place
    pub(crate) fn take_tlab(&self, empty: SmallObjectAllocator) -> SmallObjectAllocator {
        std::mem::replace(&mut *self.tlab.lock(), empty)
    }

    pub(crate) fn store_buffer(&self) -> &Mutex<StoreBuffer> {
        &self.store_buffer
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    pub(crate) fn add_root(&self, handle: *const GcHandle) {
        self.roots.lock().insert(handle as usize);
    }

    pub(crate) fn remove_root(&self, handle: *const GcHandle) -> bool {
        self.roots.lock().shift_remove(&(handle as usize))
    }

    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }

    /// Visit every registered root handle
    pub(crate) fn for_each_root(&self, f: &mut dyn FnMut(&GcHandle)) {
        for &addr in self.roots.lock().iter() {
            // SAFETY: registered handles outlive their registration.
            f(unsafe { GcHandle::from_address(addr) });
        }
    }

    // ------------------------------------------------------------------
    // Pins
    // ------------------------------------------------------------------

    pub(crate) fn add_pin(&self, ptr: *mut u8) {
        *self.pins.lock().entry(ptr as usize).or_insert(0) += 1;
    }

    pub(crate) fn remove_pin(&self, ptr: *mut u8) -> Result<()> {
        let mut pins = self.pins.lock();
        let addr = ptr as usize;
        match pins.get_mut(&addr) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                pins.shift_remove(&addr);
            }
            None => {
                return Err(GcError::ProtocolViolation(format!(
                    "{:#x} is not pinned by this thread",
                    addr
                )))
            }
        }
        Ok(())
    }

    pub(crate) fn push_pin(&self, ptr: *mut u8) {
        self.pin_stack.lock().push(ptr as usize);
    }

    /// Pop the top of the pin stack, which must be `ptr`
    pub(crate) fn pop_pin(&self, ptr: *mut u8) -> Result<()> {
        let mut stack = self.pin_stack.lock();
        match stack.last() {
            Some(&top) if top == ptr as usize => {
                stack.pop();
                Ok(())
            }
            Some(&top) => Err(GcError::ProtocolViolation(format!(
                "pin stack top is {:#x}, popped {:#x}",
                top, ptr as usize
            ))),
            None => Err(GcError::ProtocolViolation(format!(
                "pin stack is empty, popped {:#x}",
                ptr as usize
            ))),
        }
    }

    pub fn pin_count(&self) -> usize {
        self.pins.lock().values().sum::<usize>() + self.pin_stack.lock().len()
    }

    /// Visit every pinned pointer (multiset pins, then the pin stack)
    pub(crate) fn for_each_pin(&self, f: &mut dyn FnMut(*mut u8)) {
        for &addr in self.pins.lock().keys() {
            f(addr as *mut u8);
        }
        for &addr in self.pin_stack.lock().iter() {
            f(addr as *mut u8);
        }
    }

    // ------------------------------------------------------------------
    // Uninitialized cells
    // ------------------------------------------------------------------

    pub(crate) fn add_uninit(&self, cell: *mut u8) {
        self.uninit.lock().insert(cell as usize);
    }

    pub(crate) fn remove_uninit(&self, cell: *mut u8) -> bool {
        self.uninit.lock().shift_remove(&(cell as usize))
    }

    pub fn uninit_count(&self) -> usize {
        self.uninit.lock().len()
    }

    pub(crate) fn for_each_uninit(&self, f: &mut dyn FnMut(*mut u8)) {
        for &addr in self.uninit.lock().iter() {
            f(addr as *mut u8);
        }
    }
}

impl std::fmt::Debug for ThreadDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadDescriptor")
            .field("id", &self.id)
            .field("stack", &self.stack)
            .field("roots", &self.root_count())
            .field("pins", &self.pin_count())
            .field("uninit", &self.uninit_count())
            .finish()
    }
}
