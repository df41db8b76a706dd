//! # PGC - Precise, Concurrent, Compacting Garbage Collector
//!
//! PGC is a garbage collector runtime for managed objects living inside a
//! Rust process. It is precise: the collector only follows references that
//! type metadata or registered roots tell it about.
//!
//! ## Overview
//!
//! - **Memory Index**: page-granular map from any address to the descriptor
//!   of the memory that owns it (thread stack, pool chunk, large object)
//! - **Bucketed TLABs**: per-thread size-class pools for small objects, a
//!   shared allocator for objects above 4 KiB
//! - **Packet Marking**: fixed pool of mark packets shared by parallel
//!   marker threads with termination detection
//! - **Concurrent Marking**: marking runs alongside mutators, a write
//!   barrier records new references in a remembered set
//! - **Two-Finger Compaction**: sparse pools are compacted in place, moved
//!   references are fixed through a forwarding table
//! - **Signal-Based Safepoints**: mutators are suspended with `SIGUSR1`;
//!   a thread inside an unsafe scope defers suspension until it leaves
//!
//! ## Quick Start
//!
//! ```rust
//! use pgc::{AllocRequest, GarbageCollector, GcConfig, GcHandle, GcOptions, GcRoot, TypeMeta};
//!
//! // struct Node { next: GcHandle, value: u64 }
//! static NODE: TypeMeta = TypeMeta::new("Node", 16, &[0]);
//!
//! fn main() -> Result<(), pgc::GcError> {
//!     let gc = GarbageCollector::new(GcConfig {
//!         concurrent: false,
//!         gc_threads: 2,
//!         ..Default::default()
//!     })?;
//!     let _mutator = gc.register_thread()?;
//!
//!     // Allocate, initialize and commit
//!     let node = gc.allocate(&AllocRequest::of(&NODE))?;
//!     let next = unsafe { GcHandle::from_address(node.ptr as usize) };
//!     gc.write_barrier_ptr(next, std::ptr::null_mut());
//!     gc.commit(&node)?;
//!
//!     // Keep it alive across collections
//!     let root = GcRoot::new(&gc, node.ptr)?;
//!     gc.gc(GcOptions::collect())?;
//!     assert!(gc.lookup_cell(root.get()).is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Mutator Threads                      │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐               │
//! │  │  TLAB    │  │  TLAB    │  │  TLAB    │  roots, pins  │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘  store buffer │
//! │       └─────────────┴─────────────┘                     │
//! │                     │ write barrier                     │
//! └─────────────────────┼───────────────────────────────────┘
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  GarbageCollector                       │
//! │  ThreadManager ── stop-the-world ──► WorldSnapshot      │
//! │  Marker ◄── PacketManager, RemSet                       │
//! │  GcHeap ── MemoryIndex, CoreAllocator, LOA              │
//! │  collect: sweep / compact ──► Forwarding ──► fix        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Safety
//!
//! 1. **Register every mutator thread** before allocating or touching roots
//! 2. **Commit or abort every allocation**: uncommitted cells stay pinned
//! 3. **Store references through write barriers** while marking may run
//! 4. **Re-read roots after a collection**: unpinned objects may have moved
//!
//! ## Modules
//!
//! - [`allocator`]: size-class pools, TLABs, large objects
//! - [`config`]: GC configuration parameters and validation
//! - [`error`]: Error types for all PGC operations
//! - [`gc`]: Collector driver, barriers, roots and pins
//! - [`heap`]: Core page allocator and shared heap state
//! - [`index`]: Memory index and cell descriptors
//! - [`logging`]: Structured GC event log
//! - [`marker`]: Mark packets, remembered set, parallel marker
//! - [`object`]: Handles, type metadata, object boxes
//! - [`relocate`]: Forwarding and two-finger compaction
//! - [`runtime`]: Thread registry, safepoints, stop-the-world
//! - [`stats`]: Performance statistics and monitoring
//! - [`util`]: Alignment and bitmap helpers
//!
//! ## Platform Support
//!
//! Unix only: suspension relies on POSIX signals and `pthread_kill`.

#[cfg(not(unix))]
compile_error!("pgc requires a Unix platform (POSIX signals and pthreads)");

// Core GC modules
pub mod config;
pub mod error;
pub mod gc;
pub mod logging;

// Memory management subsystems
pub mod allocator;
pub mod heap;
pub mod index;
pub mod object;

// GC algorithm components
pub mod marker;
pub mod relocate;

// Runtime and monitoring
pub mod runtime;
pub mod stats;

// Utilities
pub mod util;

// Re-export main types for convenience
pub use allocator::{AllocRequest, AllocResponse};
pub use config::{GcConfig, OverflowPolicy};
pub use error::{GcError, Result};
pub use gc::{GarbageCollector, GcKind, GcOptions, GcPhase, GcRoot, InitiationPoint, MutatorGuard};
pub use index::GcCell;
pub use object::{GcHandle, TypeMeta};
pub use runtime::{SafeScope, UnsafeScope};
pub use stats::{GcRunStats, GcStats, GcStatsSnapshot, HeapStat};

/// PGC version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = GcConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
