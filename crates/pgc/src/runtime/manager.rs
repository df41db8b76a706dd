//! Thread Manager - Mutator Registry and Stop-the-World
//!
//! Keeps the registry of mutator threads and stops them on request.
//!
//! ## Registration
//!
//! The calling thread is bound to the manager's `StwControl` in
//! thread-local state before it becomes visible in the registry, so a
//! suspension signal can never reach a registered thread that does not
//! know where to park.
//!
//! ## Lock discipline
//!
//! The registry lock is held by `WorldSnapshot` for the whole pause.
//! Everything that may block on the registry lock runs in a safe scope, so
//! a thread waiting for it can still be parked.

use std::sync::Arc;
use std::thread::ThreadId;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::allocator::SmallObjectAllocator;
use crate::error::{GcError, Result};
use crate::index::MemoryIndex;
use crate::runtime::safepoint::{in_unsafe_scope, SafeScope, UnsafeScope};
use crate::runtime::signal::{with_local, StwControl};
use crate::runtime::snapshot::WorldSnapshot;
use crate::runtime::thread::ThreadDescriptor;

/// ThreadManager - registry of mutator threads
pub struct ThreadManager {
    threads: Mutex<IndexMap<ThreadId, Arc<ThreadDescriptor>>>,
    control: Arc<StwControl>,
}

impl ThreadManager {
    pub fn new() -> Result<Self> {
        Ok(Self {
            threads: Mutex::new(IndexMap::new()),
            control: Arc::new(StwControl::new()?),
        })
    }

    /// Register the calling thread with `tlab` as its allocator
    ///
    /// # Returns
    /// `ProtocolViolation` if the thread is already registered
    pub fn register_current(
        &self,
        index: &MemoryIndex,
        tlab: SmallObjectAllocator,
    ) -> Result<Arc<ThreadDescriptor>> {
        let _scope = UnsafeScope::enter();
        if with_local(|local| local.is_attached()) {
            return Err(GcError::ProtocolViolation(
                "thread is already registered with a collector".to_string(),
            ));
        }

        let mut desc = ThreadDescriptor::current(tlab);
        desc.index_stack(index);
        let desc = Arc::new(desc);

        {
            let _safe = SafeScope::enter();
            let mut threads = self.threads.lock();
            with_local(|local| local.attach(&self.control, Arc::clone(&desc)));
            threads.insert(desc.id(), Arc::clone(&desc));
        }

        log::debug!("registered managed thread {:?}", desc.id());
        Ok(desc)
    }

    /// Deregister the calling thread
    ///
    /// # Returns
    /// The thread's descriptor, or None if it was not registered here
    pub fn deregister_current(&self, index: &MemoryIndex) -> Option<Arc<ThreadDescriptor>> {
        let desc = {
            let _safe = SafeScope::enter();
            let mut threads = self.threads.lock();
            let desc = with_local(|local| local.descriptor_for(&self.control))?;
            threads.shift_remove(&desc.id());
            with_local(|local| local.detach());
            desc
        };

        desc.deindex_stack(index);
        log::debug!("deregistered managed thread {:?}", desc.id());
        Some(desc)
    }

    /// Descriptor of the calling thread, if registered here
    pub fn current(&self) -> Option<Arc<ThreadDescriptor>> {
        with_local(|local| local.descriptor_for(&self.control))
    }

    pub fn is_registered(&self) -> bool {
        self.current().is_some()
    }

    pub fn thread_count(&self) -> usize {
        let _safe = SafeScope::enter();
        self.threads.lock().len()
    }

    /// Suspend every registered thread except the caller
    ///
    /// # Returns
    /// `InvalidState` if the calling thread is inside an unsafe scope
    pub fn stop_the_world(&self) -> Result<WorldSnapshot<'_>> {
        if in_unsafe_scope() {
            return Err(GcError::InvalidState {
                expected: "safe scope".to_string(),
                actual: "stop-the-world is disabled by current thread".to_string(),
            });
        }

        let threads = self.threads.lock();
        let current = std::thread::current().id();
        for (id, desc) in threads.iter() {
            if *id == current {
                continue;
            }
            if let Err(err) = self.control.suspend_thread(desc.native()) {
                log::error!("failed to suspend {:?}: {}", id, err);
                self.control.wait_for_world_stop();
                self.control.wait_for_world_start();
                return Err(err);
            }
        }
        self.control.wait_for_world_stop();

        Ok(WorldSnapshot::new(threads, &self.control))
    }

    pub fn control(&self) -> &StwControl {
        &self.control
    }
}

impl std::fmt::Debug for ThreadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadManager")
            .field("control", &self.control)
            .finish()
    }
}
