//! World Snapshot - The Stopped World
//!
//! RAII view of "every registered thread, stopped". Holds the registry
//! lock for its whole lifetime; dropping it restarts the world.

use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::MutexGuard;

use crate::object::GcHandle;
use crate::runtime::signal::StwControl;
use crate::runtime::thread::ThreadDescriptor;

/// WorldSnapshot - registered threads while they are suspended
pub struct WorldSnapshot<'a> {
    threads: MutexGuard<'a, IndexMap<ThreadId, Arc<ThreadDescriptor>>>,
    control: &'a StwControl,
    stopped_at: Instant,
}

impl<'a> WorldSnapshot<'a> {
    pub(crate) fn new(
        threads: MutexGuard<'a, IndexMap<ThreadId, Arc<ThreadDescriptor>>>,
        control: &'a StwControl,
    ) -> Self {
        log::trace!(
            "world stopped: {} threads, {} suspended",
            threads.len(),
            control.threads_suspended()
        );
        Self {
            threads,
            control,
            stopped_at: Instant::now(),
        }
    }

    /// Every registered thread, including the one that stopped the world
    pub fn threads(&self) -> impl Iterator<Item = &Arc<ThreadDescriptor>> + '_ {
        self.threads.values()
    }

    pub fn lookup_thread(&self, id: ThreadId) -> Option<&Arc<ThreadDescriptor>> {
        self.threads.get(&id)
    }

    /// Visit the registered root handles of every thread
    pub fn trace_roots(&self, f: &mut dyn FnMut(&GcHandle)) {
        for desc in self.threads.values() {
            desc.for_each_root(f);
        }
    }

    /// Visit the pinned pointers of every thread
    pub fn trace_pins(&self, f: &mut dyn FnMut(*mut u8)) {
        for desc in self.threads.values() {
            desc.for_each_pin(f);
        }
    }

    /// Visit the uncommitted cells of every thread
    pub fn trace_uninit(&self, f: &mut dyn FnMut(*mut u8)) {
        for desc in self.threads.values() {
            desc.for_each_uninit(f);
        }
    }

    pub fn time_since_stop_the_world(&self) -> Duration {
        self.stopped_at.elapsed()
    }

    pub fn threads_suspended(&self) -> usize {
        self.control.threads_suspended()
    }
}

impl Drop for WorldSnapshot<'_> {
    fn drop(&mut self) {
        self.control.wait_for_world_start();
        log::trace!(
            "world restarted after {:?}",
            self.stopped_at.elapsed()
        );
    }
}

impl std::fmt::Debug for WorldSnapshot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldSnapshot")
            .field("threads", &self.threads.len())
            .field("suspended", &self.threads_suspended())
            .field("stopped_for", &self.time_since_stop_the_world())
            .finish()
    }
}
