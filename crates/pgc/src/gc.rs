//! GC Core Module - Collector Driver
//!
//! Orchestrates collection cycles and exposes the mutator interface
//! (allocation, commit, roots, pins, barriers).
//!
//! ## Phases
//!
//! ```text
//!            LaunchConcurrentMark              Collect
//!   Idle ───────────────────────────► Mark ────────────► Collect ──► Idle
//!     │        (STW: roots, spawn           (STW: flush store buffers,
//!     │         marker threads)              re-trace roots, remset,
//!     │                                      final drain)
//!     └──────────────────────────────────────────────────┘
//!                       Collect from Idle (full STW trace)
//! ```
//!
//! ## Locking
//!
//! One cycle at a time (`gc_lock`). The collector enters a safe scope before
//! taking the lock, so a thread waiting for it can still be suspended by
//! the thread currently collecting. Every mutator operation runs inside an
//! unsafe scope and never blocks on a lock the collector holds while the
//! world is stopping.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;
use serde::Serialize;

use crate::allocator::{
    AllocRequest, AllocResponse, PoolAllocator, SmallObjectAllocator, LARGE_CELL_SIZE,
};
use crate::config::{GcConfig, OverflowPolicy};
use crate::error::{GcError, Result};
use crate::heap::GcHeap;
use crate::index::{GcCell, MemoryRef};
use crate::logging::{self, GcEvent, GcLoggerConfig};
use crate::marker::{Marker, PacketManager, RemSet};
use crate::object::{gc_box, GcHandle, TypeMeta};
use crate::relocate::Forwarding;
use crate::runtime::{SafeScope, ThreadDescriptor, ThreadManager, UnsafeScope, WorldSnapshot};
use crate::stats::{GcRunStats, GcStats, HeapStat, PhaseTimer};

/// What a `gc()` call should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GcKind {
    /// Scan roots and start marker threads, then resume mutators
    LaunchConcurrentMark,
    /// Finish (or run) marking, then sweep and compact
    Collect,
}

/// Options of one `gc()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcOptions {
    pub kind: GcKind,
    /// Generation to collect; the heap has a single generation 0
    pub generation: usize,
}

impl GcOptions {
    pub fn collect() -> Self {
        Self {
            kind: GcKind::Collect,
            generation: 0,
        }
    }

    pub fn launch_concurrent_mark() -> Self {
        Self {
            kind: GcKind::LaunchConcurrentMark,
            generation: 0,
        }
    }
}

impl Default for GcOptions {
    fn default() -> Self {
        Self::collect()
    }
}

/// Collector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum GcPhase {
    /// No cycle in progress
    Idle = 0,
    /// Marker threads trace concurrently with mutators
    Mark = 1,
    /// World stopped, sweeping and compacting
    Collect = 2,
}

impl GcPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => GcPhase::Mark,
            2 => GcPhase::Collect,
            _ => GcPhase::Idle,
        }
    }
}

/// Why a cycle was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InitiationPoint {
    /// Explicit `gc()` call
    UserRequest,
    /// Allocation hit the heap limit
    HeapLimitExceeded,
    /// Heap occupancy crossed the marking threshold
    MarkThreshold,
}

/// GarbageCollector - orchestrator for collection cycles
///
/// Coordinates all GC components:
/// - GcHeap for allocation
/// - ThreadManager for mutator registration and stop-the-world
/// - Marker for reachability
/// - Forwarding for compaction fix-up
/// - Stats for performance monitoring
///
/// ## Thread Safety
///
/// `GarbageCollector` is `Send + Sync`; share it with `Arc`. Each mutator
/// thread registers itself with [`register_thread`](Self::register_thread)
/// before touching managed memory.
pub struct GarbageCollector {
    config: GcConfig,
    heap: GcHeap,
    threads: ThreadManager,
    packets: Arc<PacketManager>,
    remset: Arc<RemSet>,
    marker: Marker,
    static_roots: Mutex<IndexSet<usize>>,
    phase: AtomicU8,
    gc_lock: Mutex<()>,
    stats: GcStats,
    pool: rayon::ThreadPool,
    cycle: AtomicU64,
}

impl GarbageCollector {
    /// Create a new GarbageCollector with specified configuration
    ///
    /// # Examples
    /// ```rust
    /// use pgc::{GarbageCollector, GcConfig};
    ///
    /// let gc = GarbageCollector::new(GcConfig::default())?;
    /// # Ok::<(), pgc::GcError>(())
    /// ```
    pub fn new(config: GcConfig) -> Result<Self> {
        config.validate()?;

        if config.verbose {
            logging::configure_logger(GcLoggerConfig {
                console: true,
                ..Default::default()
            });
        }

        let heap = GcHeap::new(&config);
        let packets = Arc::new(PacketManager::new(config.packet_count));
        let remset = Arc::new(RemSet::new());
        let marker = Marker::new(
            Arc::clone(heap.index()),
            Arc::clone(&packets),
            Arc::clone(&remset),
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.gc_threads)
            .thread_name(|i| format!("gc-worker-{}", i))
            .build()
            .map_err(|err| GcError::ThreadPool(err.to_string()))?;

        log::debug!(
            "collector created: limit={} max={} concurrent={} compacting={}",
            config.initial_heap_limit,
            config.max_heap_size,
            config.concurrent,
            config.compacting
        );

        Ok(Self {
            threads: ThreadManager::new()?,
            heap,
            packets,
            remset,
            marker,
            static_roots: Mutex::new(IndexSet::new()),
            phase: AtomicU8::new(GcPhase::Idle as u8),
            gc_lock: Mutex::new(()),
            stats: GcStats::new(),
            pool,
            cycle: AtomicU64::new(0),
            config,
        })
    }

    // ========================================================================
    // Thread registration
    // ========================================================================

    /// Register the calling thread as a mutator
    ///
    /// The returned guard deregisters the thread when dropped.
    pub fn register_thread(&self) -> Result<MutatorGuard<'_>> {
        let desc = self
            .threads
            .register_current(self.heap.index(), self.heap.new_tlab())?;
        emit(GcEvent::ThreadRegistered { thread: desc.id() });
        Ok(MutatorGuard {
            gc: self,
            _not_send: PhantomData,
        })
    }

    /// Deregister the calling thread
    ///
    /// The thread's TLAB is handed to the heap and collected with the rest
    /// of the heap until it is empty.
    pub fn deregister_thread(&self) -> Result<()> {
        let desc = self
            .threads
            .deregister_current(self.heap.index())
            .ok_or_else(|| GcError::ProtocolViolation("thread is not registered".to_string()))?;

        {
            let mut buffer = desc.store_buffer().lock();
            self.remset.flush(&mut buffer);
        }
        let tlab = desc.take_tlab(self.heap.new_tlab());
        self.heap.adopt(tlab);

        emit(GcEvent::ThreadDeregistered { thread: desc.id() });
        Ok(())
    }

    fn current_thread(&self) -> Result<Arc<ThreadDescriptor>> {
        self.threads
            .current()
            .ok_or_else(|| GcError::ProtocolViolation("thread is not registered".to_string()))
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a cell for `req`
    ///
    /// The cell stays uninitialized (and pinned across collections) until
    /// it is committed or aborted. A full heap triggers a collection, then
    /// a heap expansion, before `OutOfMemory` is returned.
    ///
    /// # Errors
    /// - `ProtocolViolation` if the calling thread is not registered
    /// - `InvalidArgument` if the request overflows the address space
    /// - `OutOfMemory` if no memory could be produced
    pub fn allocate(&self, req: &AllocRequest) -> Result<AllocResponse> {
        let desc = self.current_thread()?;
        let box_size = req.box_size()?;
        self.check_marking_threshold();

        let mut attempt = 0;
        loop {
            let result = {
                let _scope = UnsafeScope::enter();
                let result = if box_size > LARGE_CELL_SIZE {
                    self.heap.allocate_large(req)
                } else {
                    desc.tlab().lock().allocate(req)
                };
                if let Ok(response) = &result {
                    desc.add_uninit(response.cell_start);
                }
                result
            };

            match result {
                Err(GcError::HeapLimitExceeded { .. }) => {}
                other => return other,
            }

            match attempt {
                0 => {
                    self.run(GcOptions::collect(), InitiationPoint::HeapLimitExceeded)?;
                }
                1 if self.expand_heap() => {}
                _ => break,
            }
            attempt += 1;
        }

        let heap_size = self.heap.heap_size();
        emit(GcEvent::AllocationFailure {
            size: box_size,
            heap_size,
        });
        Err(GcError::OutOfMemory {
            requested: box_size,
            available: self.heap.heap_limit().saturating_sub(heap_size),
        })
    }

    /// Mark a freshly allocated cell as initialized
    pub fn commit(&self, response: &AllocResponse) -> Result<()> {
        self.commit_cell(response, None)
    }

    /// Commit a cell and attach the type metadata known only after construction
    pub fn commit_with_meta(&self, response: &AllocResponse, meta: &'static TypeMeta) -> Result<()> {
        self.commit_cell(response, Some(meta))
    }

    fn commit_cell(&self, response: &AllocResponse, meta: Option<&'static TypeMeta>) -> Result<()> {
        let desc = self.current_thread()?;
        let _scope = UnsafeScope::enter();
        if !desc.remove_uninit(response.cell_start) {
            return Err(GcError::ProtocolViolation(format!(
                "cell {:p} is not awaiting commit",
                response.cell_start
            )));
        }

        let cell = response.cell();
        match meta {
            Some(meta) => cell.commit_with_meta(meta),
            None => cell.commit(),
        }
        if self.marking_in_progress() {
            cell.set_mark(true);
        }
        Ok(())
    }

    /// Give up on a cell that will never be committed
    pub fn abort(&self, response: &AllocResponse) -> Result<()> {
        let desc = self.current_thread()?;
        let _scope = UnsafeScope::enter();
        if !desc.remove_uninit(response.cell_start) {
            return Err(GcError::ProtocolViolation(format!(
                "cell {:p} is not awaiting commit",
                response.cell_start
            )));
        }
        if let MemoryRef::Pool(_) = response.memory {
            desc.tlab().lock().deallocate(response.cell_start)?;
        }
        Ok(())
    }

    // ========================================================================
    // Roots and pins
    // ========================================================================

    /// Register `handle` as a root
    ///
    /// A handle on a registered stack becomes a root of the calling thread,
    /// a handle outside any indexed memory becomes a static root, and a
    /// handle inside a heap cell is a field that needs no registration.
    ///
    /// # Safety
    /// `handle` must stay at its address until it is deregistered.
    pub unsafe fn register_root(&self, handle: &GcHandle) -> Result<()> {
        let _scope = UnsafeScope::enter();
        match self.heap.index().lookup(handle.address()) {
            Some(MemoryRef::Stack(_)) => self.current_thread()?.add_root(handle),
            Some(_) => {}
            None => {
                self.static_roots.lock().insert(handle.address());
            }
        }
        Ok(())
    }

    /// Remove a root registered with [`register_root`](Self::register_root)
    pub fn deregister_root(&self, handle: &GcHandle) -> Result<()> {
        let _scope = UnsafeScope::enter();
        let removed = match self.heap.index().lookup(handle.address()) {
            Some(MemoryRef::Stack(_)) => self.current_thread()?.remove_root(handle),
            Some(_) => true,
            None => self.static_roots.lock().shift_remove(&handle.address()),
        };
        if !removed {
            return Err(GcError::ProtocolViolation(format!(
                "handle {:#x} is not a registered root",
                handle.address()
            )));
        }
        Ok(())
    }

    /// Number of registered static roots
    pub fn static_root_count(&self) -> usize {
        let _scope = UnsafeScope::enter();
        self.static_roots.lock().len()
    }

    /// Pin the target of `handle` until [`deregister_pin`](Self::deregister_pin)
    ///
    /// # Returns
    /// The pinned pointer (null handles pin nothing)
    pub fn register_pin(&self, handle: &GcHandle) -> Result<*mut u8> {
        let desc = self.current_thread()?;
        let _scope = UnsafeScope::enter();
        let ptr = handle.get();
        if !ptr.is_null() {
            desc.add_pin(ptr);
        }
        Ok(ptr)
    }

    pub fn deregister_pin(&self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let desc = self.current_thread()?;
        let _scope = UnsafeScope::enter();
        desc.remove_pin(ptr)
    }

    /// Pin the target of `handle` on the thread's LIFO pin stack
    pub fn push_pin(&self, handle: &GcHandle) -> Result<*mut u8> {
        let desc = self.current_thread()?;
        let _scope = UnsafeScope::enter();
        let ptr = handle.get();
        if !ptr.is_null() {
            desc.push_pin(ptr);
        }
        Ok(ptr)
    }

    /// Pop the pin pushed last; `ptr` must match it
    pub fn pop_pin(&self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let desc = self.current_thread()?;
        let _scope = UnsafeScope::enter();
        desc.pop_pin(ptr)
    }

    // ========================================================================
    // Barriers
    // ========================================================================

    /// Load a managed reference
    pub fn read_barrier(&self, handle: &GcHandle) -> *mut u8 {
        let _scope = UnsafeScope::enter();
        handle.load(Ordering::Acquire)
    }

    /// Store the reference held by `src` into `dst`
    pub fn write_barrier(&self, dst: &GcHandle, src: &GcHandle) {
        let _scope = UnsafeScope::enter();
        self.store_reference(dst, src.load(Ordering::Acquire));
    }

    /// Store `ptr` into `dst`
    pub fn write_barrier_ptr(&self, dst: &GcHandle, ptr: *mut u8) {
        let _scope = UnsafeScope::enter();
        self.store_reference(dst, ptr);
    }

    /// Move `handle` by `offset` bytes within its target object
    pub fn interior_write_barrier(&self, handle: &GcHandle, offset: isize) {
        let _scope = UnsafeScope::enter();
        let ptr = handle.load(Ordering::Acquire);
        handle.store(ptr.wrapping_offset(offset), Ordering::Release);
    }

    fn store_reference(&self, dst: &GcHandle, ptr: *mut u8) {
        if self.marking_in_progress() && !ptr.is_null() {
            let white = self
                .heap
                .lookup_cell(ptr)
                .map_or(false, |cell| !cell.get_mark());
            if white {
                match self.threads.current() {
                    Some(desc) => self.remset.add(&mut desc.store_buffer().lock(), ptr as usize),
                    None => self.remset.add_direct(ptr as usize),
                }
            }
        }
        dst.store(ptr, Ordering::Release);
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Run one collector step
    ///
    /// # Errors
    /// - `InvalidArgument` for a generation other than 0
    /// - `InvalidState` for a concurrent launch on a serial collector, or
    ///   while marking is already running
    /// - `MarkingOverflow` under `OverflowPolicy::Fail`
    pub fn gc(&self, options: GcOptions) -> Result<GcRunStats> {
        self.run(options, InitiationPoint::UserRequest)?
            .ok_or_else(|| GcError::InvalidState {
                expected: "idle collector".to_string(),
                actual: "marking already in progress".to_string(),
            })
    }

    /// Implicit trigger from allocation paths
    ///
    /// # Returns
    /// The run report, or None if the policy decided not to run
    pub fn initiation_point(&self, point: InitiationPoint) -> Result<Option<GcRunStats>> {
        match point {
            InitiationPoint::UserRequest | InitiationPoint::HeapLimitExceeded => {
                self.run(GcOptions::collect(), point)
            }
            InitiationPoint::MarkThreshold => {
                if !self.config.concurrent || self.phase() != GcPhase::Idle {
                    return Ok(None);
                }
                self.run(GcOptions::launch_concurrent_mark(), point)
            }
        }
    }

    fn check_marking_threshold(&self) {
        if !self.config.concurrent || self.phase() != GcPhase::Idle {
            return;
        }
        if self.heap.core().occupancy() < self.config.marking_threshold {
            return;
        }
        if let Err(err) = self.initiation_point(InitiationPoint::MarkThreshold) {
            log::warn!("concurrent mark not started: {}", err);
        }
    }

    fn run(&self, options: GcOptions, reason: InitiationPoint) -> Result<Option<GcRunStats>> {
        if options.generation != 0 {
            return Err(GcError::InvalidArgument(format!(
                "generation {} does not exist",
                options.generation
            )));
        }

        let _safe = SafeScope::enter();
        let _lock = self.gc_lock.lock();

        let run = match options.kind {
            GcKind::LaunchConcurrentMark => {
                if !self.config.concurrent {
                    return Err(GcError::InvalidState {
                        expected: "concurrent collector".to_string(),
                        actual: "serial collector".to_string(),
                    });
                }
                if self.phase() != GcPhase::Idle {
                    if reason == InitiationPoint::MarkThreshold {
                        return Ok(None);
                    }
                    return Err(GcError::InvalidState {
                        expected: "idle collector".to_string(),
                        actual: format!("{:?} phase", self.phase()),
                    });
                }
                self.launch_concurrent_mark(reason)?
            }
            GcKind::Collect => self.collect(reason)?,
        };

        if self.config.stats_enabled {
            self.stats.record(&run);
        }
        Ok(Some(run))
    }

    fn begin_cycle(&self, kind: GcKind, reason: InitiationPoint) -> GcRunStats {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        emit(GcEvent::CycleStart {
            cycle,
            kind: format!("{:?}", kind),
            reason: format!("{:?}", reason),
        });
        GcRunStats::new(cycle, kind, reason)
    }

    /// STW root scan, then marker threads continue while mutators run
    fn launch_concurrent_mark(&self, reason: InitiationPoint) -> Result<GcRunStats> {
        let mut run = self.begin_cycle(GcKind::LaunchConcurrentMark, reason);
        let mut timer = PhaseTimer::start();

        let world = self.threads.stop_the_world()?;
        run.threads_stopped = world.threads_suspended();

        self.marker.reset();
        self.marker.set_unbounded(false);
        self.remset.clear();
        self.trace_mutator_roots(&world);
        self.set_phase(GcPhase::Mark);

        match self.marker.concurrent_mark(self.config.marker_threads()) {
            Ok(()) => {}
            Err(GcError::MarkingOverflow) => {
                run.overflow = true;
                self.recover_overflow(&world, &run)?;
            }
            Err(err) => {
                self.abandon_marking(&world);
                return Err(err);
            }
        }

        run.mark_time = timer.lap();
        run.pause = world.time_since_stop_the_world();
        drop(world);

        emit(GcEvent::Pause {
            cycle: run.cycle,
            duration_us: run.pause.as_micros() as u64,
            threads: run.threads_stopped,
        });
        log::debug!(
            "cycle {}: concurrent marking launched with {} threads",
            run.cycle,
            self.config.marker_threads()
        );
        Ok(run)
    }

    /// Finish marking (or run it from scratch) and collect the heap
    fn collect(&self, reason: InitiationPoint) -> Result<GcRunStats> {
        let from_mark = self.phase() == GcPhase::Mark;
        let mut run = if from_mark {
            GcRunStats::new(self.cycle.load(Ordering::Relaxed), GcKind::Collect, reason)
        } else {
            self.begin_cycle(GcKind::Collect, reason)
        };
        let mut timer = PhaseTimer::start();

        let world = self.threads.stop_the_world()?;
        run.threads_stopped = world.threads_suspended();

        // Mark
        emit(GcEvent::PhaseStart {
            cycle: run.cycle,
            phase: "mark".to_string(),
        });
        let marked = if from_mark {
            self.finish_concurrent_mark(&world)
        } else {
            self.mark_from_scratch(&world)
        };
        match marked {
            Ok(()) => {}
            Err(GcError::MarkingOverflow) => {
                run.overflow = true;
                self.recover_overflow(&world, &run)?;
            }
            Err(err) => {
                self.abandon_marking(&world);
                return Err(err);
            }
        }
        run.marked_cells = self.marker.marked_count();
        run.mark_time = timer.lap();
        emit(GcEvent::PhaseEnd {
            cycle: run.cycle,
            phase: "mark".to_string(),
            duration_ms: run.mark_time.as_secs_f64() * 1000.0,
        });

        // Collect
        self.set_phase(GcPhase::Collect);
        run.heap = self.collect_heap(&world);
        run.collect_time = timer.lap();
        emit(GcEvent::PhaseEnd {
            cycle: run.cycle,
            phase: "collect".to_string(),
            duration_ms: run.collect_time.as_secs_f64() * 1000.0,
        });

        self.marker.reset();
        self.marker.set_unbounded(false);
        self.set_phase(GcPhase::Idle);

        run.pause = world.time_since_stop_the_world();
        drop(world);

        let released = self.heap.core().shrink();
        self.report_cycle(&run, released);
        Ok(run)
    }

    fn finish_concurrent_mark(&self, world: &WorldSnapshot<'_>) -> Result<()> {
        for desc in world.threads() {
            self.remset.flush(&mut desc.store_buffer().lock());
        }
        if self.marker.overflowed() {
            return Err(GcError::MarkingOverflow);
        }
        self.trace_mutator_roots(world);
        self.marker.trace_remset();
        self.marker.mark()
    }

    fn mark_from_scratch(&self, world: &WorldSnapshot<'_>) -> Result<()> {
        self.marker.reset();
        self.marker.set_unbounded(false);
        self.remset.clear();
        self.trace_mutator_roots(world);
        self.marker.concurrent_mark(self.config.marker_threads().saturating_sub(1))?;
        self.marker.mark()
    }

    /// Clear all marks and re-trace with an unbounded serial mark stack
    fn recover_overflow(&self, world: &WorldSnapshot<'_>, run: &GcRunStats) -> Result<()> {
        let policy = self.config.overflow_policy;
        log::warn!(
            "cycle {}: mark packets overflowed, policy {:?}",
            run.cycle,
            policy
        );
        emit(GcEvent::MarkOverflow {
            cycle: run.cycle,
            policy,
        });

        if policy == OverflowPolicy::Fail {
            self.abandon_marking(world);
            return Err(GcError::MarkingOverflow);
        }

        self.marker.reset();
        self.clear_marks(world);
        self.remset.clear();
        self.marker.set_unbounded(true);
        self.trace_mutator_roots(world);
        self.marker.mark()
    }

    fn abandon_marking(&self, world: &WorldSnapshot<'_>) {
        self.marker.reset();
        self.marker.set_unbounded(false);
        self.clear_marks(world);
        self.remset.clear();
        self.set_phase(GcPhase::Idle);
    }

    /// Shade every root of the stopped world
    ///
    /// Uncommitted cells are pinned and scanned conservatively: any word
    /// resolving to a heap cell pins that cell too.
    fn trace_mutator_roots(&self, world: &WorldSnapshot<'_>) {
        let index = self.heap.index();

        world.trace_uninit(&mut |ptr| {
            let cell = match index.get_cell(ptr) {
                Some(cell) => cell,
                None => return,
            };
            self.pin_root(cell);
            // SAFETY: the cell is allocated and the world is stopped.
            unsafe {
                gc_box::scan_words(cell.cell_start(), cell.cell_size(), &mut |word| {
                    if let Some(target) = index.get_cell(word as *mut u8) {
                        self.pin_root(target);
                    }
                });
            }
        });

        world.trace_roots(&mut |handle| self.marker.add_root_ptr(handle.get()));
        for &addr in self.static_roots.lock().iter() {
            // SAFETY: registered handles outlive their registration.
            let handle = unsafe { GcHandle::from_address(addr) };
            self.marker.add_root_ptr(handle.get());
        }

        world.trace_pins(&mut |ptr| {
            if let Some(cell) = index.get_cell(ptr) {
                self.pin_root(cell);
            }
        });
    }

    fn pin_root(&self, cell: GcCell) {
        cell.set_pin(true);
        self.marker.add_root(cell);
    }

    /// Lock every TLAB (registered and orphaned)
    fn lock_tlabs<'w>(
        &'w self,
        world: &'w WorldSnapshot<'_>,
    ) -> (
        Vec<MutexGuard<'w, SmallObjectAllocator>>,
        MutexGuard<'w, Vec<SmallObjectAllocator>>,
    ) {
        let tlabs = world.threads().map(|desc| desc.tlab().lock()).collect();
        (tlabs, self.heap.orphans().lock())
    }

    fn clear_marks(&self, world: &WorldSnapshot<'_>) {
        let (tlabs, orphans) = self.lock_tlabs(world);
        for tlab in tlabs.iter().map(|guard| &**guard).chain(orphans.iter()) {
            tlab.finalize();
        }
        self.heap.loa().finalize();
    }

    /// Sweep and compact every allocator, then fix moved references
    fn collect_heap(&self, world: &WorldSnapshot<'_>) -> HeapStat {
        let forwarding = Forwarding::new(Arc::clone(self.heap.index()));
        let compacting = self.config.compacting;

        let (mut tlabs, mut orphans) = self.lock_tlabs(world);
        let mut pools: Vec<&mut PoolAllocator> = tlabs
            .iter_mut()
            .flat_map(|tlab| tlab.buckets_mut().iter_mut())
            .chain(orphans.iter_mut().flat_map(|tlab| tlab.buckets_mut().iter_mut()))
            .collect();

        let mut stat = self.pool.install(|| {
            pools
                .par_iter_mut()
                .map(|pool| pool.collect(&forwarding, compacting))
                .reduce(HeapStat::default, |a, b| a + b)
        });
        stat += self.heap.loa().collect();

        if forwarding.entries() > 0 {
            self.pool.install(|| {
                pools.par_iter_mut().for_each(|pool| pool.fix(&forwarding));
            });
            self.heap.loa().fix(&forwarding);

            for &addr in self.static_roots.lock().iter() {
                // SAFETY: registered handles outlive their registration.
                forwarding.forward(unsafe { GcHandle::from_address(addr) });
            }
            world.trace_roots(&mut |handle| forwarding.forward(handle));
            log::trace!(
                "fixed references after {} moves ({} bytes)",
                forwarding.entries(),
                forwarding.bytes_copied()
            );
        }

        self.pool.install(|| {
            pools.par_iter_mut().for_each(|pool| pool.finalize());
        });
        self.heap.loa().finalize();

        drop(pools);
        orphans.retain(|tlab| !tlab.is_empty());
        stat
    }

    fn report_cycle(&self, run: &GcRunStats, released: usize) {
        emit(GcEvent::Pause {
            cycle: run.cycle,
            duration_us: run.pause.as_micros() as u64,
            threads: run.threads_stopped,
        });
        emit(GcEvent::CycleEnd {
            cycle: run.cycle,
            duration_ms: run.pause.as_secs_f64() * 1000.0,
            freed_bytes: run.heap.mem_freed,
            copied_bytes: run.heap.mem_copied,
        });
        emit(GcEvent::HeapStats {
            heap_size: self.heap.heap_size(),
            heap_limit: self.heap.heap_limit(),
            live_bytes: run.heap.mem_live,
            residency: run.heap.residency(),
        });
        log::info!(
            "cycle {} ({:?}): pause {:?}, freed {} bytes, copied {} bytes, released {} bytes{}",
            run.cycle,
            run.reason,
            run.pause,
            run.heap.mem_freed,
            run.heap.mem_copied,
            released,
            if run.overflow { ", mark overflow" } else { "" }
        );
    }

    // ========================================================================
    // Heap control and queries
    // ========================================================================

    /// Double the heap limit, capped at the maximum heap size
    pub fn expand_heap(&self) -> bool {
        let old_limit = self.heap.heap_limit();
        let grown = self.heap.core().expand_heap();
        if grown {
            emit(GcEvent::HeapExpanded {
                old_limit,
                new_limit: self.heap.heap_limit(),
            });
        }
        grown
    }

    pub fn set_heap_limit(&self, limit: usize) {
        self.heap.core().set_heap_limit(limit);
    }

    pub fn phase(&self) -> GcPhase {
        GcPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: GcPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Check if concurrent marking is running
    pub fn marking_in_progress(&self) -> bool {
        self.phase() == GcPhase::Mark
    }

    /// Resolve any pointer (interior included) to its heap cell
    pub fn lookup_cell(&self, ptr: *mut u8) -> Option<GcCell> {
        self.heap.lookup_cell(ptr)
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn heap(&self) -> &GcHeap {
        &self.heap
    }

    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Number of cycles started so far
    pub fn cycle_count(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    pub fn packet_count(&self) -> usize {
        self.packets.count()
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("phase", &self.phase())
            .field("cycle", &self.cycle_count())
            .field("heap", &self.heap)
            .field("marker", &self.marker)
            .finish()
    }
}

/// Log an event without being suspended while holding the logger
fn emit(event: GcEvent) {
    let _scope = UnsafeScope::enter();
    logging::log_event(event);
}

/// Registration of the current thread; deregisters on drop
#[must_use = "the thread is deregistered when the guard is dropped"]
pub struct MutatorGuard<'gc> {
    gc: &'gc GarbageCollector,
    _not_send: PhantomData<*const ()>,
}

impl MutatorGuard<'_> {
    pub fn collector(&self) -> &GarbageCollector {
        self.gc
    }
}

impl Drop for MutatorGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.gc.deregister_thread() {
            log::error!("failed to deregister thread: {}", err);
        }
    }
}

/// Boxed static root; deregistered on drop
pub struct GcRoot<'gc> {
    gc: &'gc GarbageCollector,
    handle: Box<GcHandle>,
}

impl<'gc> GcRoot<'gc> {
    pub fn new(gc: &'gc GarbageCollector, ptr: *mut u8) -> Result<Self> {
        let handle = Box::new(GcHandle::new(ptr));
        // SAFETY: the box keeps the handle at a fixed address until drop,
        // which deregisters it.
        unsafe { gc.register_root(&handle)? };
        Ok(Self { gc, handle })
    }

    pub fn get(&self) -> *mut u8 {
        self.gc.read_barrier(&self.handle)
    }

    pub fn set(&self, ptr: *mut u8) {
        self.gc.write_barrier_ptr(&self.handle, ptr);
    }

    pub fn handle(&self) -> &GcHandle {
        &self.handle
    }
}

impl Drop for GcRoot<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.gc.deregister_root(&self.handle) {
            log::error!("failed to deregister root: {}", err);
        }
    }
}

impl std::fmt::Debug for GcRoot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GcRoot").field(&self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MB;

    static NODE: TypeMeta = TypeMeta::new("Node", 16, &[0]);

    fn collector(concurrent: bool) -> GarbageCollector {
        GarbageCollector::new(GcConfig {
            initial_heap_limit: 4 * MB,
            max_heap_size: 16 * MB,
            gc_threads: 2,
            concurrent,
            ..Default::default()
        })
        .unwrap()
    }

    fn new_node(gc: &GarbageCollector, next: *mut u8) -> *mut u8 {
        let response = gc.allocate(&AllocRequest::of(&NODE)).unwrap();
        let field = unsafe { GcHandle::from_address(response.ptr as usize) };
        gc.write_barrier_ptr(field, next);
        gc.commit(&response).unwrap();
        response.ptr
    }

    #[test]
    fn test_allocate_requires_registration() {
        let gc = collector(false);
        assert!(matches!(
            gc.allocate(&AllocRequest::raw(8)),
            Err(GcError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_unrooted_object_is_freed() {
        let gc = collector(false);
        let _mutator = gc.register_thread().unwrap();
        let ptr = new_node(&gc, std::ptr::null_mut());

        let run = gc.gc(GcOptions::collect()).unwrap();

        assert!(run.heap.mem_freed > 0);
        assert!(gc.lookup_cell(ptr).is_none() || !gc.lookup_cell(ptr).unwrap().is_init());
    }

    #[test]
    fn test_static_root_keeps_chain_alive() {
        // Arrange
        let gc = collector(false);
        let _mutator = gc.register_thread().unwrap();
        let tail = new_node(&gc, std::ptr::null_mut());
        let head = new_node(&gc, tail);
        let root = GcRoot::new(&gc, head).unwrap();

        // Act
        gc.gc(GcOptions::collect()).unwrap();

        // Assert
        let head = root.get();
        let cell = gc.lookup_cell(head).unwrap();
        assert!(cell.is_init());
        let next = gc.read_barrier(unsafe { GcHandle::from_address(head as usize) });
        assert!(gc.lookup_cell(next).unwrap().is_init());
    }

    #[test]
    fn test_uncommitted_cell_survives() {
        let gc = collector(false);
        let _mutator = gc.register_thread().unwrap();
        let response = gc.allocate(&AllocRequest::of(&NODE)).unwrap();

        gc.gc(GcOptions::collect()).unwrap();

        assert_eq!(gc.lookup_cell(response.ptr).unwrap().cell_start(), response.cell_start);
        gc.commit(&response).unwrap();
        assert!(gc.commit(&response).is_err());
    }

    #[test]
    fn test_launch_rejected_on_serial_collector() {
        let gc = collector(false);
        assert!(matches!(
            gc.gc(GcOptions::launch_concurrent_mark()),
            Err(GcError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_generation_must_be_zero() {
        let gc = collector(false);
        let options = GcOptions {
            kind: GcKind::Collect,
            generation: 1,
        };
        assert!(matches!(gc.gc(options), Err(GcError::InvalidArgument(_))));
    }

    #[test]
    fn test_concurrent_cycle_phases() {
        let gc = collector(true);
        let _mutator = gc.register_thread().unwrap();

        gc.gc(GcOptions::launch_concurrent_mark()).unwrap();
        assert!(gc.marking_in_progress());
        assert!(gc.gc(GcOptions::launch_concurrent_mark()).is_err());
        assert_eq!(
            gc.initiation_point(InitiationPoint::MarkThreshold).unwrap().map(|r| r.cycle),
            None
        );

        let run = gc.gc(GcOptions::collect()).unwrap();
        assert_eq!(run.cycle, 1);
        assert_eq!(gc.phase(), GcPhase::Idle);
        assert_eq!(gc.stats().snapshot().concurrent_marks, 1);
    }

    #[test]
    fn test_pin_api_balances() {
        let gc = collector(false);
        let _mutator = gc.register_thread().unwrap();
        let ptr = new_node(&gc, std::ptr::null_mut());
        let handle = GcHandle::new(ptr);

        let pinned = gc.push_pin(&handle).unwrap();
        assert_eq!(pinned, ptr);
        assert!(gc.pop_pin(0x10 as *mut u8).is_err());
        gc.pop_pin(pinned).unwrap();

        let pinned = gc.register_pin(&handle).unwrap();
        gc.deregister_pin(pinned).unwrap();
        assert!(gc.deregister_pin(pinned).is_err());
    }

    #[test]
    fn test_interior_write_barrier_advances_handle() {
        let gc = collector(false);
        let handle = GcHandle::new(0x1000 as *mut u8);
        gc.interior_write_barrier(&handle, 24);
        assert_eq!(handle.get() as usize, 0x1018);
        gc.interior_write_barrier(&handle, -8);
        assert_eq!(handle.get() as usize, 0x1010);
    }
}
