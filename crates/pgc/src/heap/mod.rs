//! Heap Module - Shared Heap State
//!
//! Owns the pieces of the heap every thread shares:
//!
//! - the memory index (address -> descriptor)
//! - the core allocator (page source and heap-size accounting)
//! - the large object allocator
//! - orphaned TLABs of deregistered threads
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    GcHeap                     │
//! │  ┌────────┐ ┌────────┐ ┌──────────────────┐  │
//! │  │ TLAB 1 │ │ TLAB 2 │ │ orphaned TLABs   │  │
//! │  └───┬────┘ └───┬────┘ └────────┬─────────┘  │
//! │      └──────────┼───────────────┘            │
//! │                 ▼          LargeObjectAlloc  │
//! │           CoreAllocator ◄─────────┘          │
//! │                 │                            │
//! │            MemoryIndex                       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! TLABs live in thread descriptors while their thread is registered.
//! Orphans keep getting collected until they own no chunk.

pub mod core;
pub mod sys;

pub use self::core::CoreAllocator;
pub use sys::{align_to_page, page_size, PageBlock};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::{AllocRequest, AllocResponse, LargeObjectAllocator, SmallObjectAllocator};
use crate::config::GcConfig;
use crate::error::Result;
use crate::index::{GcCell, MemoryIndex};

/// GcHeap - memory shared by every mutator
pub struct GcHeap {
    index: Arc<MemoryIndex>,
    core: Arc<CoreAllocator>,
    loa: LargeObjectAllocator,
    orphans: Mutex<Vec<SmallObjectAllocator>>,
}

impl GcHeap {
    pub fn new(config: &GcConfig) -> Self {
        let index = Arc::new(MemoryIndex::new());
        let core = Arc::new(CoreAllocator::new(
            config.initial_heap_limit,
            config.max_heap_size,
        ));
        let loa = LargeObjectAllocator::new(Arc::clone(&index), Arc::clone(&core));
        Self {
            index,
            core,
            loa,
            orphans: Mutex::new(Vec::new()),
        }
    }

    pub fn index(&self) -> &Arc<MemoryIndex> {
        &self.index
    }

    pub fn core(&self) -> &CoreAllocator {
        &self.core
    }

    pub fn loa(&self) -> &LargeObjectAllocator {
        &self.loa
    }

    /// Fresh, empty TLAB backed by this heap
    pub fn new_tlab(&self) -> SmallObjectAllocator {
        SmallObjectAllocator::new(Arc::clone(&self.index), Arc::clone(&self.core))
    }

    pub fn allocate_large(&self, req: &AllocRequest) -> Result<AllocResponse> {
        self.loa.allocate(req)
    }

    /// Take over the TLAB of a deregistered thread
    pub fn adopt(&self, tlab: SmallObjectAllocator) {
        if tlab.is_empty() {
            return;
        }
        log::trace!("adopted orphaned TLAB of {} bytes", tlab.occupied());
        self.orphans.lock().push(tlab);
    }

    pub(crate) fn orphans(&self) -> &Mutex<Vec<SmallObjectAllocator>> {
        &self.orphans
    }

    /// Drop orphans that no longer own memory
    ///
    /// # Returns
    /// Number of orphans released
    pub fn release_empty_orphans(&self) -> usize {
        let mut orphans = self.orphans.lock();
        let before = orphans.len();
        orphans.retain(|tlab| !tlab.is_empty());
        before - orphans.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Resolve any pointer to its heap cell
    pub fn lookup_cell(&self, ptr: *mut u8) -> Option<GcCell> {
        self.index.get_cell(ptr)
    }

    pub fn heap_size(&self) -> usize {
        self.core.heap_size()
    }

    pub fn heap_limit(&self) -> usize {
        self.core.heap_limit()
    }
}

impl std::fmt::Debug for GcHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHeap")
            .field("core", &self.core)
            .field("large_objects", &self.loa.len())
            .field("orphans", &self.orphan_count())
            .finish()
    }
}
