//! Remembered Set
//!
//! Targets of reference stores performed while concurrent marking runs.
//! Mutators log into a thread-local `StoreBuffer` and flush it into the
//! shared set once it fills up; the collector flushes every buffer at the
//! final pause. Entries are drained exactly once per marking pass.

use std::hash::BuildHasherDefault;

use indexmap::IndexSet;
use parking_lot::Mutex;
use rustc_hash::FxHasher;

/// Entries per thread-local store buffer
pub const STORE_BUFFER_SIZE: usize = 64;

type FxIndexSet = IndexSet<usize, BuildHasherDefault<FxHasher>>;

/// StoreBuffer - per-thread log of barriered stores
#[derive(Debug)]
pub struct StoreBuffer {
    entries: Vec<usize>,
}

impl StoreBuffer {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(STORE_BUFFER_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StoreBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// RemSet - shared set of remembered targets
pub struct RemSet {
    set: Mutex<FxIndexSet>,
}

impl RemSet {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(FxIndexSet::default()),
        }
    }

    /// Log `ptr` into `buffer`, flushing it when it fills up
    pub fn add(&self, buffer: &mut StoreBuffer, ptr: usize) {
        buffer.entries.push(ptr);
        if buffer.entries.len() >= STORE_BUFFER_SIZE {
            self.flush(buffer);
        }
    }

    /// Insert `ptr` directly into the shared set
    pub fn add_direct(&self, ptr: usize) {
        self.set.lock().insert(ptr);
    }

    /// Move every buffered entry into the shared set
    pub fn flush(&self, buffer: &mut StoreBuffer) {
        if buffer.entries.is_empty() {
            return;
        }
        self.set.lock().extend(buffer.entries.drain(..));
    }

    /// Remove and return one entry
    pub fn get(&self) -> Option<usize> {
        self.set.lock().pop()
    }

    /// Remove and return up to `max` entries
    pub fn drain(&self, max: usize) -> Vec<usize> {
        let mut set = self.set.lock();
        let keep = set.len().saturating_sub(max);
        set.drain(keep..).collect()
    }

    pub fn clear(&self) {
        self.set.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.set.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().is_empty()
    }
}

impl Default for RemSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RemSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemSet").field("len", &self.len()).finish()
    }
}
