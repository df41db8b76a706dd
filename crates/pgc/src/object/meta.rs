//! Type Metadata
//!
//! Per-type description of the offsets that hold managed references. The
//! collector never reads a vtable from an object: it walks these offsets.
//! Metadata is immutable and lives for the whole process.

use crate::error::{GcError, Result};
use crate::object::{gc_box, GcHandle};
use crate::util::Alignment;

/// Static layout of a managed type
///
/// # Examples
///
/// ```rust
/// use pgc::TypeMeta;
///
/// // struct Node { value: u64, next: GcHandle }
/// static NODE: TypeMeta = TypeMeta::new("Node", 16, &[8]);
/// assert!(NODE.validate().is_ok());
/// ```
#[derive(Debug)]
pub struct TypeMeta {
    name: &'static str,
    size: usize,
    offsets: &'static [usize],
}

impl TypeMeta {
    /// Describe a type of `size` bytes whose handles live at `offsets`
    pub const fn new(name: &'static str, size: usize, offsets: &'static [usize]) -> Self {
        Self {
            name,
            size,
            offsets,
        }
    }

    /// Build metadata at runtime and give it a `'static` lifetime
    ///
    /// Metadata is created once per type and never destroyed.
    pub fn leak(name: &'static str, size: usize, offsets: Vec<usize>) -> Result<&'static TypeMeta> {
        let offsets: &'static [usize] = Box::leak(offsets.into_boxed_slice());
        let meta: &'static TypeMeta = Box::leak(Box::new(TypeMeta::new(name, size, offsets)));
        meta.validate()?;
        Ok(meta)
    }

    /// Check that every handle offset is aligned and inside the object
    pub fn validate(&self) -> Result<()> {
        for &offset in self.offsets {
            if !Alignment::is_aligned(offset, Alignment::WORD) {
                return Err(GcError::InvalidArgument(format!(
                    "{}: handle offset {} is not word aligned",
                    self.name, offset
                )));
            }
            if offset + std::mem::size_of::<GcHandle>() > self.size {
                return Err(GcError::InvalidArgument(format!(
                    "{}: handle offset {} exceeds type size {}",
                    self.name, offset, self.size
                )));
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offsets(&self) -> &'static [usize] {
        self.offsets
    }

    /// Distance between array elements of this type inside a cell
    pub fn stride(&self) -> usize {
        gc_box::object_stride(self.size)
    }

    /// Type without any managed reference
    pub fn is_plain(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Visit every handle of `count` consecutive objects starting at `obj_start`
    ///
    /// # Safety
    /// `obj_start` must point to `count` objects laid out by this metadata.
    pub(crate) unsafe fn for_each_handle(
        &self,
        obj_start: *mut u8,
        count: usize,
        f: &mut dyn FnMut(&GcHandle),
    ) {
        if self.is_plain() {
            return;
        }
        let stride = self.stride();
        for i in 0..count {
            let obj = obj_start.add(i * stride);
            for &offset in self.offsets {
                f(GcHandle::from_address(obj as usize + offset));
            }
        }
    }
}
