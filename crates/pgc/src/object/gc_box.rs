//! GC Box - Cell Header
//!
//! Each cell starts with a three-word header:
//! - word 0: type metadata pointer (freelist link while the cell is free)
//! - word 1: object count
//! - word 2: forward pointer (non-null once the cell's object has moved)
//!
//! All functions take the cell start address. Callers guarantee the
//! address points to a cell of the owning chunk or large block.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::object::{GcHandle, TypeMeta};
use crate::util::Alignment;

#[repr(C)]
pub(crate) struct BoxHeader {
    meta: AtomicPtr<TypeMeta>,
    count: AtomicUsize,
    forward: AtomicPtr<u8>,
}

/// Size of the cell header in bytes
pub const HEADER_SIZE: usize = std::mem::size_of::<BoxHeader>();

/// Distance between consecutive objects of `obj_size` bytes in one cell
pub fn object_stride(obj_size: usize) -> usize {
    Alignment::align_up(obj_size, Alignment::WORD)
}

/// Cell bytes needed for `count` objects of `obj_size` bytes
///
/// Returns None if the size does not fit in the address space.
pub fn box_size(obj_size: usize, count: usize) -> Option<usize> {
    Alignment::checked_align_up(obj_size, Alignment::WORD)?
        .checked_mul(count)?
        .checked_add(HEADER_SIZE)
}

#[inline]
unsafe fn header<'a>(cell: *mut u8) -> &'a BoxHeader {
    &*(cell as *const BoxHeader)
}

/// Object start for a cell
#[inline]
pub fn object_start(cell: *mut u8) -> *mut u8 {
    cell.wrapping_add(HEADER_SIZE)
}

/// Write a fresh header into a zeroed cell
pub(crate) unsafe fn init(cell: *mut u8, count: usize, meta: Option<&'static TypeMeta>) {
    let meta = meta.map_or(ptr::null_mut(), |m| m as *const TypeMeta as *mut TypeMeta);
    ptr::write(
        cell as *mut BoxHeader,
        BoxHeader {
            meta: AtomicPtr::new(meta),
            count: AtomicUsize::new(count),
            forward: AtomicPtr::new(ptr::null_mut()),
        },
    );
}

pub(crate) unsafe fn type_meta(cell: *mut u8) -> Option<&'static TypeMeta> {
    let meta = header(cell).meta.load(Ordering::Acquire);
    if meta.is_null() {
        None
    } else {
        Some(&*meta)
    }
}

pub(crate) unsafe fn set_type_meta(cell: *mut u8, meta: &'static TypeMeta) {
    header(cell)
        .meta
        .store(meta as *const TypeMeta as *mut TypeMeta, Ordering::Release);
}

pub(crate) unsafe fn object_count(cell: *mut u8) -> usize {
    header(cell).count.load(Ordering::Acquire)
}

pub(crate) unsafe fn forward_pointer(cell: *mut u8) -> Option<*mut u8> {
    let fwd = header(cell).forward.load(Ordering::Acquire);
    if fwd.is_null() {
        None
    } else {
        Some(fwd)
    }
}

pub(crate) unsafe fn set_forward_pointer(cell: *mut u8, to: *mut u8) {
    header(cell).forward.store(to, Ordering::Release);
}

/// Visit every handle of the objects stored in `cell`
pub(crate) unsafe fn trace(cell: *mut u8, f: &mut dyn FnMut(&GcHandle)) {
    if let Some(meta) = type_meta(cell) {
        meta.for_each_handle(object_start(cell), object_count(cell), f);
    }
}

/// Copy a whole cell to `to` and clear the copy's forward pointer
pub(crate) unsafe fn move_cell(from: *mut u8, to: *mut u8, cell_size: usize) {
    ptr::copy_nonoverlapping(from, to, cell_size);
    header(to).forward.store(ptr::null_mut(), Ordering::Release);
}

/// Visit every word-aligned value in the object area of `cell`
pub(crate) unsafe fn scan_words(cell: *mut u8, cell_size: usize, f: &mut dyn FnMut(usize)) {
    let mut addr = object_start(cell) as usize;
    let end = cell as usize + cell_size;
    while addr + Alignment::WORD <= end {
        f(ptr::read(addr as *const usize));
        addr += Alignment::WORD;
    }
}

/// Freelist link stored in word 0 of a free cell
pub(crate) unsafe fn free_link(cell: *mut u8) -> usize {
    ptr::read(cell as *const usize)
}

pub(crate) unsafe fn set_free_link(cell: *mut u8, next: usize) {
    ptr::write(cell as *mut usize, next);
}
