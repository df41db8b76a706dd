//! Index Module - Address to Descriptor Directory
//!
//! Sparse three-level radix tree keyed on the page number of an address.
//! Every indexed page maps to the descriptor of the memory that owns it.
//!
//! ```text
//! 47        36 35        24 23        12 11         0
//! +-----------+------------+------------+------------+
//! |  root idx |  node idx  |  leaf idx  |  in-page   |
//! +-----------+------------+------------+------------+
//! ```
//!
//! Lookups are lock-free. Interior nodes are published with a CAS, so a
//! reader either sees null or a fully built node. Nodes are never freed
//! before the index itself is dropped.

pub mod descriptor;
pub mod stack;

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::error::{GcError, Result};
use crate::util::Alignment;

pub use descriptor::{GcCell, LifetimeTag, MemoryDescriptor, MemoryKind, MemoryRef};
pub use stack::StackDescriptor;

/// Index granularity in bits
pub const INDEX_PAGE_BITS: usize = 12;
/// Index granularity in bytes
pub const INDEX_PAGE_SIZE: usize = 1 << INDEX_PAGE_BITS;

const LEVEL_BITS: usize = 12;
const LEVEL_SIZE: usize = 1 << LEVEL_BITS;
const LEVEL_MASK: usize = LEVEL_SIZE - 1;
const ADDRESS_BITS: usize = INDEX_PAGE_BITS + 3 * LEVEL_BITS;

struct Leaf {
    entries: Box<[AtomicUsize]>,
}

impl Leaf {
    fn new() -> Self {
        Self {
            entries: (0..LEVEL_SIZE).map(|_| AtomicUsize::new(0)).collect(),
        }
    }
}

struct Node {
    leaves: Box<[AtomicPtr<Leaf>]>,
}

impl Node {
    fn new() -> Self {
        Self {
            leaves: (0..LEVEL_SIZE)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
        }
    }
}

/// Publish a child node into `slot`, or return the one another thread won with
fn get_or_create<T>(slot: &AtomicPtr<T>, create: bool, make: fn() -> T) -> *mut T {
    let current = slot.load(Ordering::Acquire);
    if !current.is_null() || !create {
        return current;
    }
    let fresh = Box::into_raw(Box::new(make()));
    match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => fresh,
        Err(existing) => {
            // SAFETY: `fresh` was never published.
            drop(unsafe { Box::from_raw(fresh) });
            existing
        }
    }
}

/// MemoryIndex - maps addresses to memory descriptors
pub struct MemoryIndex {
    root: Box<[AtomicPtr<Node>]>,
    indexed_pages: AtomicUsize,
}

impl MemoryIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            root: (0..LEVEL_SIZE)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            indexed_pages: AtomicUsize::new(0),
        }
    }

    fn split(addr: usize) -> Option<(usize, usize, usize)> {
        if addr >> ADDRESS_BITS != 0 {
            return None;
        }
        let page = addr >> INDEX_PAGE_BITS;
        Some((
            (page >> (2 * LEVEL_BITS)) & LEVEL_MASK,
            (page >> LEVEL_BITS) & LEVEL_MASK,
            page & LEVEL_MASK,
        ))
    }

    fn entry(&self, addr: usize, create: bool) -> Option<&AtomicUsize> {
        let (i0, i1, i2) = Self::split(addr)?;
        let node = get_or_create(&self.root[i0], create, Node::new);
        if node.is_null() {
            return None;
        }
        // SAFETY: published nodes live until the index is dropped.
        let node = unsafe { &*node };
        let leaf = get_or_create(&node.leaves[i1], create, Leaf::new);
        if leaf.is_null() {
            return None;
        }
        let leaf = unsafe { &*leaf };
        Some(&leaf.entries[i2])
    }

    fn check_range(base: usize, size: usize) -> Result<()> {
        if size == 0
            || !Alignment::is_aligned(base, INDEX_PAGE_SIZE)
            || !Alignment::is_aligned(size, INDEX_PAGE_SIZE)
        {
            return Err(GcError::InvalidArgument(format!(
                "index range {:#x}+{:#x} is not page aligned",
                base, size
            )));
        }
        Ok(())
    }

    /// Register `memory` for the page-aligned range `[base, base + size)`
    ///
    /// Fails if any page of the range is already indexed; the range is then
    /// left untouched.
    pub fn index(&self, base: usize, size: usize, memory: MemoryRef) -> Result<()> {
        Self::check_range(base, size)?;
        let word = memory.encode();

        let mut page = base;
        while page < base + size {
            let entry = self
                .entry(page, true)
                .ok_or(GcError::InvalidPointer { address: page })?;
            if entry
                .compare_exchange(0, word, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.clear_pages(base, page);
                return Err(GcError::ProtocolViolation(format!(
                    "page {:#x} is already indexed",
                    page
                )));
            }
            page += INDEX_PAGE_SIZE;
        }

        self.indexed_pages
            .fetch_add(size / INDEX_PAGE_SIZE, Ordering::Relaxed);
        log::trace!("indexed {:#x}..{:#x} as {:?}", base, base + size, memory);
        Ok(())
    }

    fn clear_pages(&self, from: usize, to: usize) {
        let mut page = from;
        while page < to {
            if let Some(entry) = self.entry(page, false) {
                entry.store(0, Ordering::Release);
            }
            page += INDEX_PAGE_SIZE;
        }
    }

    /// Remove the range `[base, base + size)` from the index
    ///
    /// Fails if any page of the range is not indexed; the range is then
    /// left untouched.
    pub fn deindex(&self, base: usize, size: usize) -> Result<()> {
        Self::check_range(base, size)?;

        let mut page = base;
        while page < base + size {
            let indexed = self
                .entry(page, false)
                .map_or(false, |entry| entry.load(Ordering::Acquire) != 0);
            if !indexed {
                return Err(GcError::ProtocolViolation(format!(
                    "page {:#x} is not indexed",
                    page
                )));
            }
            page += INDEX_PAGE_SIZE;
        }

        self.clear_pages(base, base + size);
        self.indexed_pages
            .fetch_sub(size / INDEX_PAGE_SIZE, Ordering::Relaxed);

        log::trace!("deindexed {:#x}..{:#x}", base, base + size);
        Ok(())
    }

    /// Resolve any address to the descriptor of the memory containing it
    pub fn lookup(&self, addr: usize) -> Option<MemoryRef> {
        let word = self.entry(addr, false)?.load(Ordering::Acquire);
        MemoryRef::decode(word)
    }

    /// Resolve a pointer to its heap cell, ignoring stack and foreign memory
    pub fn get_cell(&self, ptr: *mut u8) -> Option<GcCell> {
        if ptr.is_null() {
            return None;
        }
        let memory = self.lookup(ptr as usize)?;
        if !memory.is_heap() {
            return None;
        }
        let cell = GcCell::new(memory, ptr);
        if cell.cell_start().is_null() {
            None
        } else {
            Some(cell)
        }
    }

    /// Number of pages currently indexed
    pub fn indexed_pages(&self) -> usize {
        self.indexed_pages.load(Ordering::Relaxed)
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryIndex {
    fn drop(&mut self) {
        for slot in self.root.iter() {
            let node = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if node.is_null() {
                continue;
            }
            // SAFETY: exclusive access during drop.
            let node = unsafe { Box::from_raw(node) };
            for leaf in node.leaves.iter() {
                let leaf = leaf.swap(ptr::null_mut(), Ordering::AcqRel);
                if !leaf.is_null() {
                    drop(unsafe { Box::from_raw(leaf) });
                }
            }
        }
    }
}
