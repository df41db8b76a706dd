//! Stack Descriptor
//!
//! Indexed description of a registered thread stack. Lets the collector
//! tell a handle living on a mutator stack from a static or heap handle.

use crate::index::descriptor::{MemoryDescriptor, MemoryKind};

/// Stack region of one managed thread
#[derive(Debug)]
pub struct StackDescriptor {
    base: usize,
    size: usize,
}

impl StackDescriptor {
    /// Describe `[base, base + size)`
    pub fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

impl MemoryDescriptor for StackDescriptor {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_has_no_cells() {
        let stack = StackDescriptor::new(0x7000_0000, 0x10_0000);
        assert!(stack.contains(0x7000_0010));
        assert!(!stack.contains(0x7010_0000));
        assert_eq!(stack.kind(), MemoryKind::Stack);
        assert!(stack.mark(0x7000_0010 as *mut u8));
        assert!(!stack.is_init(0x7000_0010 as *mut u8));
    }
}
