//! Memory Descriptors
//!
//! A memory descriptor knows how to mark, pin, size, trace and finalize the
//! cell containing a given address. The memory index resolves any indexed
//! address to one of:
//!
//! - `StackDescriptor` - a registered thread stack (no cells)
//! - `PoolDescriptor` - a small-object chunk of fixed-size cells
//! - `LargeDescriptor` - a single large object
//!
//! The index stores a descriptor as one tagged word. The two low bits carry
//! the variant and the rest is the descriptor address; descriptors are at
//! least 8-byte aligned. Encoding and decoding stay inside this module.

use std::ptr::NonNull;

use crate::allocator::large::LargeDescriptor;
use crate::allocator::pool::PoolDescriptor;
use crate::index::stack::StackDescriptor;
use crate::object::{GcHandle, TypeMeta};

/// Kind of indexed memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Stack,
    Heap,
}

/// Lifetime state of a cell derived from its init and mark bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeTag {
    /// Never initialized (or already finalized)
    Free,
    /// Initialized but not reached by the last mark phase
    Garbage,
    /// Initialized and marked
    Live,
}

impl LifetimeTag {
    pub fn from_bits(init: bool, mark: bool) -> Self {
        match (init, mark) {
            (false, _) => LifetimeTag::Free,
            (true, false) => LifetimeTag::Garbage,
            (true, true) => LifetimeTag::Live,
        }
    }
}

/// Operations the collector needs on indexed memory
///
/// Every method accepts any address inside the cell. Stack memory has no
/// cells, so the defaults describe "nothing to mark or trace".
pub trait MemoryDescriptor: Send + Sync {
    fn kind(&self) -> MemoryKind;

    fn cell_start(&self, _ptr: *mut u8) -> *mut u8 {
        std::ptr::null_mut()
    }

    fn cell_size(&self, _ptr: *mut u8) -> usize {
        0
    }

    fn object_count(&self, _ptr: *mut u8) -> usize {
        0
    }

    fn type_meta(&self, _ptr: *mut u8) -> Option<&'static TypeMeta> {
        None
    }

    fn get_mark(&self, _ptr: *mut u8) -> bool {
        false
    }

    fn set_mark(&self, _ptr: *mut u8, _mark: bool) {}

    /// Set the mark bit and return its previous value
    fn mark(&self, _ptr: *mut u8) -> bool {
        true
    }

    fn get_pin(&self, _ptr: *mut u8) -> bool {
        false
    }

    fn set_pin(&self, _ptr: *mut u8, _pin: bool) {}

    fn is_init(&self, _ptr: *mut u8) -> bool {
        false
    }

    fn lifetime_tag(&self, ptr: *mut u8) -> LifetimeTag {
        LifetimeTag::from_bits(self.is_init(ptr), self.get_mark(ptr))
    }

    /// Mark the cell as initialized
    fn commit(&self, _ptr: *mut u8) {}

    /// Attach type metadata and mark the cell as initialized
    fn commit_with_meta(&self, _ptr: *mut u8, _meta: &'static TypeMeta) {}

    /// Visit every outgoing reference of the cell
    fn trace(&self, _ptr: *mut u8, _f: &mut dyn FnMut(&GcHandle)) {}

    /// Drop the cell's object: clears init, mark and pin
    fn finalize(&self, _ptr: *mut u8) {}
}

const TAG_MASK: usize = 0b11;
const TAG_STACK: usize = 1;
const TAG_POOL: usize = 2;
const TAG_LARGE: usize = 3;

/// Non-owning reference to an indexed descriptor
///
/// The owning allocator (or thread descriptor) keeps the descriptor alive
/// and deindexes its range before dropping it, so a `MemoryRef` obtained
/// from a lookup stays valid while its memory stays indexed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MemoryRef {
    Stack(NonNull<StackDescriptor>),
    Pool(NonNull<PoolDescriptor>),
    Large(NonNull<LargeDescriptor>),
}

// Descriptors are Sync; the reference is only an address.
unsafe impl Send for MemoryRef {}
unsafe impl Sync for MemoryRef {}

impl MemoryRef {
    pub fn stack(desc: &StackDescriptor) -> Self {
        MemoryRef::Stack(NonNull::from(desc))
    }

    pub fn pool(desc: &PoolDescriptor) -> Self {
        MemoryRef::Pool(NonNull::from(desc))
    }

    pub fn large(desc: &LargeDescriptor) -> Self {
        MemoryRef::Large(NonNull::from(desc))
    }

    pub(crate) fn encode(self) -> usize {
        let (addr, tag) = match self {
            MemoryRef::Stack(p) => (p.as_ptr() as usize, TAG_STACK),
            MemoryRef::Pool(p) => (p.as_ptr() as usize, TAG_POOL),
            MemoryRef::Large(p) => (p.as_ptr() as usize, TAG_LARGE),
        };
        debug_assert_eq!(addr & TAG_MASK, 0, "descriptor is not word aligned");
        addr | tag
    }

    pub(crate) fn decode(word: usize) -> Option<Self> {
        let addr = word & !TAG_MASK;
        match word & TAG_MASK {
            TAG_STACK => NonNull::new(addr as *mut StackDescriptor).map(MemoryRef::Stack),
            TAG_POOL => NonNull::new(addr as *mut PoolDescriptor).map(MemoryRef::Pool),
            TAG_LARGE => NonNull::new(addr as *mut LargeDescriptor).map(MemoryRef::Large),
            _ => None,
        }
    }

    pub fn kind(&self) -> MemoryKind {
        match self {
            MemoryRef::Stack(_) => MemoryKind::Stack,
            MemoryRef::Pool(_) | MemoryRef::Large(_) => MemoryKind::Heap,
        }
    }

    pub fn is_heap(&self) -> bool {
        self.kind() == MemoryKind::Heap
    }

    /// Borrow the descriptor
    pub fn descriptor(&self) -> &dyn MemoryDescriptor {
        // SAFETY: see the type-level contract; indexed descriptors outlive
        // their index entries.
        unsafe {
            match self {
                MemoryRef::Stack(p) => p.as_ref(),
                MemoryRef::Pool(p) => p.as_ref(),
                MemoryRef::Large(p) => p.as_ref(),
            }
        }
    }
}

impl std::fmt::Debug for MemoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryRef::Stack(p) => write!(f, "Stack({:p})", p.as_ptr()),
            MemoryRef::Pool(p) => write!(f, "Pool({:p})", p.as_ptr()),
            MemoryRef::Large(p) => write!(f, "Large({:p})", p.as_ptr()),
        }
    }
}

/// A heap cell: descriptor plus normalized cell start
///
/// Not an owning handle. Obtained from [`MemoryIndex::get_cell`](crate::index::MemoryIndex::get_cell)
/// or from an allocation response.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GcCell {
    memory: MemoryRef,
    cell: *mut u8,
}

// Cells travel between marker threads inside mark packets.
unsafe impl Send for GcCell {}
unsafe impl Sync for GcCell {}

impl GcCell {
    /// Build a cell for `ptr` (any address inside the cell)
    pub fn new(memory: MemoryRef, ptr: *mut u8) -> Self {
        let cell = memory.descriptor().cell_start(ptr);
        Self { memory, cell }
    }

    pub fn memory(&self) -> MemoryRef {
        self.memory
    }

    pub fn cell_start(&self) -> *mut u8 {
        self.cell
    }

    pub fn object_start(&self) -> *mut u8 {
        crate::object::gc_box::object_start(self.cell)
    }

    pub fn cell_size(&self) -> usize {
        self.memory.descriptor().cell_size(self.cell)
    }

    pub fn object_count(&self) -> usize {
        self.memory.descriptor().object_count(self.cell)
    }

    pub fn type_meta(&self) -> Option<&'static TypeMeta> {
        self.memory.descriptor().type_meta(self.cell)
    }

    pub fn get_mark(&self) -> bool {
        self.memory.descriptor().get_mark(self.cell)
    }

    pub fn set_mark(&self, mark: bool) {
        self.memory.descriptor().set_mark(self.cell, mark)
    }

    /// Set the mark bit, returning true if it was already set
    pub fn mark(&self) -> bool {
        self.memory.descriptor().mark(self.cell)
    }

    pub fn get_pin(&self) -> bool {
        self.memory.descriptor().get_pin(self.cell)
    }

    pub fn set_pin(&self, pin: bool) {
        self.memory.descriptor().set_pin(self.cell, pin)
    }

    pub fn is_init(&self) -> bool {
        self.memory.descriptor().is_init(self.cell)
    }

    pub fn lifetime_tag(&self) -> LifetimeTag {
        self.memory.descriptor().lifetime_tag(self.cell)
    }

    pub fn commit(&self) {
        self.memory.descriptor().commit(self.cell)
    }

    pub fn commit_with_meta(&self, meta: &'static TypeMeta) {
        self.memory.descriptor().commit_with_meta(self.cell, meta)
    }

    pub fn trace(&self, f: &mut dyn FnMut(&GcHandle)) {
        self.memory.descriptor().trace(self.cell, f)
    }

    pub fn finalize(&self) {
        self.memory.descriptor().finalize(self.cell)
    }
}

impl std::fmt::Debug for GcCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcCell")
            .field("memory", &self.memory)
            .field("cell", &self.cell)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime_tag_from_bits() {
        assert_eq!(LifetimeTag::from_bits(false, true), LifetimeTag::Free);
        assert_eq!(LifetimeTag::from_bits(true, false), LifetimeTag::Garbage);
        assert_eq!(LifetimeTag::from_bits(true, true), LifetimeTag::Live);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let stack = StackDescriptor::new(0x10000, 0x4000);
        let memory = MemoryRef::stack(&stack);
        let word = memory.encode();
        assert_eq!(MemoryRef::decode(word), Some(memory));
        assert_eq!(MemoryRef::decode(0), None);
        assert!(!memory.is_heap());
    }
}
