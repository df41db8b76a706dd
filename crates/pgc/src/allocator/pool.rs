//! Pool Allocator - Fixed-Size Cell Chunks
//!
//! One pool allocator serves one size class of one TLAB. Memory comes in
//! chunks from the core allocator; every chunk is indexed and described by
//! a `PoolDescriptor` holding the per-cell mark, pin and init bits.
//!
//! ```text
//! chunk: [cell 0][cell 1][cell 2] ... [cell n-1][tail]
//!         ^                     ^
//!         freelist cells        top .. end  (bump region)
//! ```
//!
//! Allocation order:
//! 1. Freelist (cells reclaimed by sweep, compaction or `deallocate`)
//! 2. Bump region of the newest chunk
//! 3. New chunk from the core allocator
//!
//! Collection releases chunks without live cells, then either compacts the
//! remaining chunks with the two-finger algorithm or sweeps them, and
//! rebuilds the freelist from every dead cell.

use std::ptr;
use std::sync::Arc;

use crate::allocator::bucket::chunk_size;
use crate::allocator::{AllocRequest, AllocResponse};
use crate::error::{GcError, Result};
use crate::heap::core::CoreAllocator;
use crate::heap::sys::PageBlock;
use crate::index::{GcCell, MemoryDescriptor, MemoryIndex, MemoryKind, MemoryRef};
use crate::object::{gc_box, GcHandle, TypeMeta};
use crate::relocate::{Forwarding, TwoFingerCompactor};
use crate::stats::HeapStat;
use crate::util::AtomicBitmap;

/// Residency below which a pool is always compacted
const COMPACT_RESIDENCY_LOW: f64 = 0.5;
/// Residency above which a pool is never compacted
const COMPACT_RESIDENCY_HIGH: f64 = 0.9;
/// Residency change that counts as "stable" in between
const COMPACT_RESIDENCY_DELTA: f64 = 0.1;

/// Descriptor of one chunk of fixed-size cells
pub struct PoolDescriptor {
    block: PageBlock,
    cell_size: usize,
    cell_count: usize,
    mark_bits: AtomicBitmap,
    pin_bits: AtomicBitmap,
    init_bits: AtomicBitmap,
}

impl PoolDescriptor {
    pub(crate) fn new(block: PageBlock, cell_size: usize) -> Self {
        let cell_count = block.len() / cell_size;
        Self {
            block,
            cell_size,
            cell_count,
            mark_bits: AtomicBitmap::new(cell_count),
            pin_bits: AtomicBitmap::new(cell_count),
            init_bits: AtomicBitmap::new(cell_count),
        }
    }

    pub fn base(&self) -> usize {
        self.block.base()
    }

    /// Chunk size in bytes
    pub fn size(&self) -> usize {
        self.block.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    /// Size of every cell in this chunk
    pub fn cell_bytes(&self) -> usize {
        self.cell_size
    }

    /// Address one past the last cell
    pub fn cells_end(&self) -> usize {
        self.base() + self.cell_count * self.cell_size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.cells_end()
    }

    fn cell_index(&self, ptr: *mut u8) -> Option<usize> {
        let addr = ptr as usize;
        if !self.contains(addr) {
            return None;
        }
        Some((addr - self.base()) / self.cell_size)
    }

    /// Cell `idx` of this chunk
    pub fn cell_at(&self, idx: usize) -> *mut u8 {
        (self.base() + idx * self.cell_size) as *mut u8
    }

    /// Cell `idx` as a `GcCell`
    pub fn gc_cell(&self, idx: usize) -> GcCell {
        GcCell::new(MemoryRef::pool(self), self.cell_at(idx))
    }

    /// Number of marked cells
    pub fn live_count(&self) -> usize {
        self.mark_bits.count_ones()
    }

    /// Number of marked and pinned cells
    pub fn pinned_count(&self) -> usize {
        (0..self.cell_count)
            .filter(|&i| self.mark_bits.get(i) && self.pin_bits.get(i))
            .count()
    }

    /// Number of initialized cells
    pub fn init_count(&self) -> usize {
        self.init_bits.count_ones()
    }

    pub(crate) fn mark_at(&self, idx: usize) -> bool {
        self.mark_bits.get(idx)
    }

    pub(crate) fn pin_at(&self, idx: usize) -> bool {
        self.pin_bits.get(idx)
    }

    pub(crate) fn init_at(&self, idx: usize) -> bool {
        self.init_bits.get(idx)
    }

    /// Clear mark and pin bits of every cell
    pub(crate) fn clear_marks(&self) {
        self.mark_bits.clear();
        self.pin_bits.clear();
    }

    fn into_block(self) -> PageBlock {
        self.block
    }
}

impl MemoryDescriptor for PoolDescriptor {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Heap
    }

    fn cell_start(&self, ptr: *mut u8) -> *mut u8 {
        self.cell_index(ptr)
            .map_or(ptr::null_mut(), |idx| self.cell_at(idx))
    }

    fn cell_size(&self, _ptr: *mut u8) -> usize {
        self.cell_size
    }

    fn object_count(&self, ptr: *mut u8) -> usize {
        match self.cell_index(ptr) {
            // SAFETY: the index is in range, so the cell holds a header.
            Some(idx) => unsafe { gc_box::object_count(self.cell_at(idx)) },
            None => 0,
        }
    }

    fn type_meta(&self, ptr: *mut u8) -> Option<&'static TypeMeta> {
        let idx = self.cell_index(ptr)?;
        if !self.init_bits.get(idx) {
            return None;
        }
        unsafe { gc_box::type_meta(self.cell_at(idx)) }
    }

    fn get_mark(&self, ptr: *mut u8) -> bool {
        self.cell_index(ptr).map_or(false, |idx| self.mark_bits.get(idx))
    }

    fn set_mark(&self, ptr: *mut u8, mark: bool) {
        if let Some(idx) = self.cell_index(ptr) {
            self.mark_bits.set(idx, mark);
        }
    }

    fn mark(&self, ptr: *mut u8) -> bool {
        self.cell_index(ptr)
            .map_or(true, |idx| self.mark_bits.test_and_set(idx))
    }

    fn get_pin(&self, ptr: *mut u8) -> bool {
        self.cell_index(ptr).map_or(false, |idx| self.pin_bits.get(idx))
    }

    fn set_pin(&self, ptr: *mut u8, pin: bool) {
        if let Some(idx) = self.cell_index(ptr) {
            self.pin_bits.set(idx, pin);
        }
    }

    fn is_init(&self, ptr: *mut u8) -> bool {
        self.cell_index(ptr).map_or(false, |idx| self.init_bits.get(idx))
    }

    fn commit(&self, ptr: *mut u8) {
        if let Some(idx) = self.cell_index(ptr) {
            self.init_bits.set(idx, true);
        }
    }

    fn commit_with_meta(&self, ptr: *mut u8, meta: &'static TypeMeta) {
        if let Some(idx) = self.cell_index(ptr) {
            unsafe { gc_box::set_type_meta(self.cell_at(idx), meta) };
            self.init_bits.set(idx, true);
        }
    }

    fn trace(&self, ptr: *mut u8, f: &mut dyn FnMut(&GcHandle)) {
        if let Some(idx) = self.cell_index(ptr) {
            if self.init_bits.get(idx) {
                // SAFETY: initialized cells hold a valid header and objects.
                unsafe { gc_box::trace(self.cell_at(idx), f) };
            }
        }
    }

    fn finalize(&self, ptr: *mut u8) {
        if let Some(idx) = self.cell_index(ptr) {
            self.init_bits.set(idx, false);
            self.mark_bits.set(idx, false);
            self.pin_bits.set(idx, false);
        }
    }
}

impl std::fmt::Debug for PoolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDescriptor")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("cell_size", &self.cell_size)
            .field("cell_count", &self.cell_count)
            .field("live", &self.live_count())
            .finish()
    }
}

/// Allocator for one size class
pub struct PoolAllocator {
    cell_size: usize,
    chunks: Vec<Box<PoolDescriptor>>,
    top: usize,
    end: usize,
    freelist: usize,
    prev_residency: f64,
    index: Arc<MemoryIndex>,
    core: Arc<CoreAllocator>,
}

impl PoolAllocator {
    pub fn new(cell_size: usize, index: Arc<MemoryIndex>, core: Arc<CoreAllocator>) -> Self {
        Self {
            cell_size,
            chunks: Vec::new(),
            top: 0,
            end: 0,
            freelist: 0,
            prev_residency: 0.0,
            index,
            core,
        }
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn chunks(&self) -> &[Box<PoolDescriptor>] {
        &self.chunks
    }

    /// Bytes owned by this pool
    pub fn occupied(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.size()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Check if `addr` lies in one of this pool's chunks
    pub fn contains(&self, addr: usize) -> bool {
        self.chunks.iter().any(|chunk| chunk.contains(addr))
    }

    /// Allocate one cell
    ///
    /// The cell is zeroed and carries a fresh header, but stays
    /// uninitialized until it is committed.
    pub fn allocate(&mut self, req: &AllocRequest) -> Result<AllocResponse> {
        debug_assert!(req.box_size().map_or(false, |size| size <= self.cell_size));

        let cell = match self.pop_free() {
            Some(cell) => cell,
            None => self.bump()?,
        };

        // SAFETY: `cell` is a free cell of one of our chunks.
        unsafe {
            ptr::write_bytes(cell, 0, self.cell_size);
            gc_box::init(cell, req.count, req.meta);
        }

        let memory = self
            .index
            .lookup(cell as usize)
            .ok_or(GcError::InvalidPointer {
                address: cell as usize,
            })?;
        Ok(AllocResponse::new(memory, cell, self.cell_size))
    }

    fn pop_free(&mut self) -> Option<*mut u8> {
        if self.freelist == 0 {
            return None;
        }
        let cell = self.freelist as *mut u8;
        self.freelist = unsafe { gc_box::free_link(cell) };
        Some(cell)
    }

    fn push_free(&mut self, cell: *mut u8) {
        unsafe { gc_box::set_free_link(cell, self.freelist) };
        self.freelist = cell as usize;
    }

    fn bump(&mut self) -> Result<*mut u8> {
        if self.top + self.cell_size > self.end {
            self.add_chunk()?;
        }
        let cell = self.top as *mut u8;
        self.top += self.cell_size;
        Ok(cell)
    }

    fn add_chunk(&mut self) -> Result<()> {
        let block = self.core.allocate(chunk_size(self.cell_size))?;
        let chunk = Box::new(PoolDescriptor::new(block, self.cell_size));

        if let Err(err) = self
            .index
            .index(chunk.base(), chunk.size(), MemoryRef::pool(&chunk))
        {
            self.core.deallocate(chunk.into_block());
            return Err(err);
        }

        log::trace!(
            "new chunk {:#x} with {} cells of {} bytes",
            chunk.base(),
            chunk.cell_count(),
            self.cell_size
        );
        self.top = chunk.base();
        self.end = chunk.cells_end();
        self.chunks.push(chunk);
        Ok(())
    }

    /// Finalize the cell containing `ptr` and put it on the freelist
    pub fn deallocate(&mut self, ptr: *mut u8) -> Result<()> {
        let chunk = self
            .chunks
            .iter()
            .find(|chunk| chunk.contains(ptr as usize))
            .ok_or(GcError::InvalidPointer {
                address: ptr as usize,
            })?;
        let cell = chunk.cell_start(ptr);
        chunk.finalize(cell);
        self.push_free(cell);
        Ok(())
    }

    fn release_chunk(&self, chunk: Box<PoolDescriptor>) {
        if let Err(err) = self.index.deindex(chunk.base(), chunk.size()) {
            log::error!("failed to deindex chunk {:#x}: {}", chunk.base(), err);
        }
        self.core.deallocate(chunk.into_block());
    }

    /// Release every chunk without a marked cell
    fn shrink(&mut self, stat: &mut HeapStat) {
        stat.mem_before_gc += self.occupied();

        let chunks = std::mem::take(&mut self.chunks);
        for chunk in chunks {
            if chunk.live_count() == 0 {
                stat.mem_freed += chunk.init_count() * self.cell_size;
                self.release_chunk(chunk);
            } else {
                stat.mem_occupied += chunk.size();
                stat.mem_live += chunk.live_count() * self.cell_size;
                stat.pinned_count += chunk.pinned_count();
                self.chunks.push(chunk);
            }
        }
    }

    fn is_compaction_required(&self, residency: f64) -> bool {
        if residency < COMPACT_RESIDENCY_LOW {
            return true;
        }
        if residency > COMPACT_RESIDENCY_HIGH {
            return false;
        }
        (residency - self.prev_residency).abs() < COMPACT_RESIDENCY_DELTA
    }

    /// Free every dead cell of every chunk and rebuild the freelist
    fn sweep(&mut self, stat: &mut HeapStat) {
        let mut free = Vec::new();
        for chunk in &self.chunks {
            for idx in 0..chunk.cell_count() {
                if chunk.mark_at(idx) {
                    continue;
                }
                if chunk.init_at(idx) {
                    chunk.finalize(chunk.cell_at(idx));
                    stat.mem_freed += self.cell_size;
                }
                free.push(chunk.cell_at(idx));
            }
        }
        // Lowest address ends up on top of the freelist.
        for cell in free.into_iter().rev() {
            self.push_free(cell);
        }
    }

    /// Collect this pool after marking
    ///
    /// Moves live cells only when `compacting` is set and the residency
    /// policy asks for it. Moved cells get a forwarding entry.
    pub fn collect(&mut self, forwarding: &Forwarding, compacting: bool) -> HeapStat {
        let mut stat = HeapStat::default();
        self.shrink(&mut stat);

        self.top = 0;
        self.end = 0;
        self.freelist = 0;

        if self.chunks.is_empty() {
            return stat;
        }

        let residency = stat.residency();
        let compact = compacting && self.is_compaction_required(residency);
        if compact {
            for chunk in &self.chunks {
                TwoFingerCompactor::compact(chunk, forwarding, &mut stat);
            }
            self.prev_residency = 1.0;
        } else {
            self.prev_residency = residency;
        }
        self.sweep(&mut stat);

        log::trace!(
            "pool {} collected: compact={} residency={:.2} freed={} copied={}",
            self.cell_size,
            compact,
            residency,
            stat.mem_freed,
            stat.mem_copied
        );
        stat
    }

    /// Forward every handle held by live cells
    pub fn fix(&self, forwarding: &Forwarding) {
        for chunk in &self.chunks {
            for idx in 0..chunk.cell_count() {
                if chunk.mark_at(idx) && chunk.init_at(idx) {
                    chunk.trace(chunk.cell_at(idx), &mut |handle| forwarding.forward(handle));
                }
            }
        }
    }

    /// Clear the mark and pin bits of every chunk
    pub fn finalize(&self) {
        for chunk in &self.chunks {
            chunk.clear_marks();
        }
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        for chunk in std::mem::take(&mut self.chunks) {
            self.release_chunk(chunk);
        }
    }
}

impl std::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("cell_size", &self.cell_size)
            .field("chunks", &self.chunks.len())
            .field("prev_residency", &self.prev_residency)
            .finish()
    }
}
