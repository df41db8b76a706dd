//! Marker Module - Packet-Based Parallel Marking
//!
//! Computes the transitive closure of the root set over the managed heap.
//!
//! Per cycle:
//! 1. Root scan - `add_root` shades roots grey (mark bit set, cell queued)
//! 2. Concurrent mark (optional) - `concurrent_mark(n)` starts n workers
//! 3. Final drain - `mark()` drains on the calling thread, then joins the
//!    workers
//!
//! Grey cells travel in mark packets. A worker pops an input packet, traces
//! every cell in it and pushes newly shaded cells to an output packet.
//!
//! ## Termination Detection
//!
//! A worker without input first publishes its output packet, then pulls a
//! few remembered-set entries, and only then checks whether every packet is
//! back in the pool and empty. A packet borrowed by another worker keeps
//! the pool short, so an idle worker keeps polling until the borrower
//! returns it.
//!
//! ## Overflow
//!
//! When no output packet can be obtained the pass fails with
//! `MarkingOverflow`. The collector then clears all marks and redoes the
//! pass in unbounded mode, where grey cells live in a growable stack.

pub mod packet;
pub mod remset;

pub use packet::{MarkPacket, PacketManager, PACKET_SIZE};
pub use remset::{RemSet, StoreBuffer, STORE_BUFFER_SIZE};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use crate::error::{GcError, Result};
use crate::index::{GcCell, MemoryIndex};

/// Remembered-set entries pulled by an idle worker at once
const POP_REMSET_COUNT: usize = 16;
/// Attempts to get a fresh output packet before overflowing
const POP_OUTPUT_ATTEMPTS: usize = 2;

struct MarkerShared {
    index: Arc<MemoryIndex>,
    packets: Arc<PacketManager>,
    remset: Arc<RemSet>,
    roots: Mutex<Vec<GcCell>>,
    running: AtomicUsize,
    done: AtomicBool,
    overflow: AtomicBool,
    unbounded: AtomicBool,
    marked: AtomicUsize,
}

impl MarkerShared {
    /// Mark the cell behind `ptr`, returning it if it was white
    fn shade(&self, ptr: *mut u8) -> Option<GcCell> {
        let target = self.index.get_cell(ptr)?;
        if target.mark() {
            return None;
        }
        self.marked.fetch_add(1, Ordering::Relaxed);
        Some(target)
    }

    fn push_to_packet(&self, output: &mut Option<Box<MarkPacket>>, cell: GcCell) -> Result<()> {
        if let Some(packet) = output.as_mut() {
            if !packet.is_full() {
                packet.push(cell);
                return Ok(());
            }
        }

        if let Some(full) = output.take() {
            self.packets.push_packet(full);
        }
        for _ in 0..POP_OUTPUT_ATTEMPTS {
            if let Some(mut packet) = self.packets.pop_output_packet() {
                if packet.is_full() {
                    self.packets.push_packet(packet);
                    continue;
                }
                packet.push(cell);
                *output = Some(packet);
                return Ok(());
            }
        }
        Err(GcError::MarkingOverflow)
    }

    fn scan(&self, cell: GcCell, output: &mut Option<Box<MarkPacket>>) -> Result<()> {
        let mut result = Ok(());
        cell.trace(&mut |handle| {
            if result.is_err() {
                return;
            }
            if let Some(target) = self.shade(handle.get()) {
                result = self.push_to_packet(output, target);
            }
        });
        result
    }

    /// Move up to `POP_REMSET_COUNT` remembered targets into `output`
    fn pull_remset(&self, output: &mut Option<Box<MarkPacket>>) -> Result<bool> {
        let entries = self.remset.drain(POP_REMSET_COUNT);
        if entries.is_empty() {
            return Ok(false);
        }
        for ptr in entries {
            if let Some(target) = self.shade(ptr as *mut u8) {
                self.push_to_packet(output, target)?;
            }
        }
        Ok(true)
    }

    fn drain_packets(&self, output: &mut Option<Box<MarkPacket>>) -> Result<()> {
        let backoff = Backoff::new();
        loop {
            if self.overflow.load(Ordering::Acquire) {
                return Err(GcError::MarkingOverflow);
            }

            if let Some(mut input) = self.packets.pop_input_packet() {
                backoff.reset();
                while let Some(cell) = input.pop() {
                    if let Err(err) = self.scan(cell, output) {
                        input.push(cell);
                        self.packets.push_packet(input);
                        return Err(err);
                    }
                }
                self.packets.push_packet(input);
                continue;
            }

            if let Some(packet) = output.take() {
                self.packets.push_packet(packet);
                continue;
            }
            if self.pull_remset(output)? {
                continue;
            }
            if self.packets.is_no_input() || self.done.load(Ordering::Acquire) {
                return Ok(());
            }
            backoff.snooze();
        }
    }

    fn worker_routine(&self) -> Result<()> {
        self.running.fetch_add(1, Ordering::AcqRel);
        let mut output = None;
        let result = self.drain_packets(&mut output);
        if let Some(packet) = output.take() {
            self.packets.push_packet(packet);
        }
        if result.is_err() {
            self.overflow.store(true, Ordering::Release);
        }
        self.running.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Move the pending roots into mark packets
    fn publish_roots(&self) -> Result<()> {
        let roots = std::mem::take(&mut *self.roots.lock());
        let mut output = None;
        let mut result = Ok(());
        for cell in roots {
            if let Err(err) = self.push_to_packet(&mut output, cell) {
                result = Err(err);
                break;
            }
        }
        if let Some(packet) = output {
            self.packets.push_packet(packet);
        }
        if result.is_err() {
            self.overflow.store(true, Ordering::Release);
        }
        result
    }

    /// Drain the pending roots with a growable stack
    fn drain_unbounded(&self) {
        let mut stack = std::mem::take(&mut *self.roots.lock());
        while let Some(cell) = stack.pop() {
            cell.trace(&mut |handle| {
                if let Some(target) = self.shade(handle.get()) {
                    stack.push(target);
                }
            });
        }
    }
}

/// Marker - computes reachability for one collection cycle
pub struct Marker {
    shared: Arc<MarkerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Marker {
    pub fn new(index: Arc<MemoryIndex>, packets: Arc<PacketManager>, remset: Arc<RemSet>) -> Self {
        Self {
            shared: Arc::new(MarkerShared {
                index,
                packets,
                remset,
                roots: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                done: AtomicBool::new(false),
                overflow: AtomicBool::new(false),
                unbounded: AtomicBool::new(false),
                marked: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Shade a root cell
    ///
    /// Already marked cells are ignored.
    pub fn add_root(&self, cell: GcCell) {
        if cell.mark() {
            return;
        }
        self.shared.marked.fetch_add(1, Ordering::Relaxed);
        self.shared.roots.lock().push(cell);
    }

    /// Shade the cell behind `ptr` as a root, if it is a heap cell
    pub fn add_root_ptr(&self, ptr: *mut u8) {
        if let Some(cell) = self.shared.index.get_cell(ptr) {
            self.add_root(cell);
        }
    }

    /// Shade every remembered target and clear the remembered set
    ///
    /// Thread store buffers must have been flushed by the caller.
    pub fn trace_remset(&self) {
        let mut count = 0;
        while let Some(ptr) = self.shared.remset.get() {
            self.add_root_ptr(ptr as *mut u8);
            count += 1;
        }
        self.shared.remset.clear();
        log::trace!("traced {} remembered set entries", count);
    }

    /// Drain to a fixpoint on the calling thread and join running workers
    pub fn mark(&self) -> Result<()> {
        if self.shared.unbounded.load(Ordering::Acquire) {
            self.shared.drain_unbounded();
            return Ok(());
        }

        let published = self.shared.publish_roots();
        let drained = match published {
            Ok(()) => self.shared.worker_routine(),
            Err(err) => Err(err),
        };
        let joined = self.join_workers();

        if self.overflowed() {
            return Err(GcError::MarkingOverflow);
        }
        drained?;
        joined
    }

    /// Start `threads` marker threads draining in the background
    pub fn concurrent_mark(&self, threads: usize) -> Result<()> {
        if self.shared.unbounded.load(Ordering::Acquire) {
            return Err(GcError::InvalidState {
                expected: "bounded marking".to_string(),
                actual: "unbounded serial marking".to_string(),
            });
        }
        self.shared.publish_roots()?;

        let mut workers = self.workers.lock();
        for i in 0..threads {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("gc-marker-{}", i))
                .spawn(move || {
                    if let Err(err) = shared.worker_routine() {
                        log::warn!("marker worker stopped: {}", err);
                    }
                })
                .map_err(|err| GcError::ThreadPool(err.to_string()))?;
            workers.push(handle);
        }
        log::debug!("started {} concurrent marker threads", threads);
        Ok(())
    }

    fn join_workers(&self) -> Result<()> {
        let workers = std::mem::take(&mut *self.workers.lock());
        let mut result = Ok(());
        for handle in workers {
            if handle.join().is_err() {
                result = Err(GcError::ThreadPool("marker thread panicked".to_string()));
            }
        }
        result
    }

    /// Check if marker threads are still tracing
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) > 0
    }

    /// Check if background workers were started and not yet joined
    pub fn has_workers(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Block until background workers reach their fixpoint
    pub fn wait(&self) -> Result<()> {
        self.join_workers()
    }

    /// Stop workers and return to a clean state
    ///
    /// Clears pending roots and packets, but not the mark bits.
    pub fn reset(&self) {
        self.shared.done.store(true, Ordering::Release);
        if let Err(err) = self.join_workers() {
            log::error!("{}", err);
        }
        self.shared.done.store(false, Ordering::Release);
        self.shared.roots.lock().clear();
        self.shared.packets.clear();
        self.shared.overflow.store(false, Ordering::Release);
        self.shared.marked.store(0, Ordering::Relaxed);
    }

    /// Switch between packet marking and the unbounded serial fallback
    pub fn set_unbounded(&self, unbounded: bool) {
        self.shared.unbounded.store(unbounded, Ordering::Release);
    }

    pub fn is_unbounded(&self) -> bool {
        self.shared.unbounded.load(Ordering::Acquire)
    }

    pub fn overflowed(&self) -> bool {
        self.shared.overflow.load(Ordering::Acquire)
    }

    /// Cells shaded since the last reset
    pub fn marked_count(&self) -> usize {
        self.shared.marked.load(Ordering::Relaxed)
    }
}

impl Drop for Marker {
    fn drop(&mut self) {
        self.shared.done.store(true, Ordering::Release);
        let _ = self.join_workers();
    }
}

impl std::fmt::Debug for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marker")
            .field("running", &self.shared.running.load(Ordering::Relaxed))
            .field("marked", &self.marked_count())
            .field("unbounded", &self.is_unbounded())
            .finish()
    }
}
