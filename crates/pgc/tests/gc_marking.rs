//! GC Marking Tests
//!
//! These tests verify reachability:
//! - Exactly the closure of the roots survives
//! - Uncommitted cells are pinned and scanned conservatively
//! - Mark packet overflow under both overflow policies
//! - The write barrier during concurrent marking

mod common;

use common::{
    assert_alive, assert_dead, build_tree, field, make_garbage, new_node, test_config, tree_size,
    value, GcFixture, LEFT, NODE,
};
use pgc::marker::PACKET_SIZE;
use pgc::{
    AllocRequest, GarbageCollector, GcConfig, GcError, GcHandle, GcOptions, GcPhase, GcRoot,
    OverflowPolicy, TypeMeta,
};
use std::sync::atomic::Ordering;

/// Test that the closure of a rooted tree survives and garbage is freed
///
/// **Bug this finds:** Marker stopping early, sweep freeing marked cells
/// **Invariant verified:** marked cells == reachable cells
#[test]
fn test_reachable_tree_survives_and_garbage_is_freed() {
    // Arrange: tree cells first, garbage after them
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    let root = GcRoot::new(gc, build_tree(gc, 8)).unwrap();
    make_garbage(gc, 300);

    // Act
    let run = gc.gc(GcOptions::collect()).unwrap();

    // Assert
    let cell_size = gc.lookup_cell(root.get()).unwrap().cell_size();
    assert_eq!(tree_size(gc, root.get()), 255);
    assert_eq!(run.marked_cells, 255);
    assert_eq!(run.heap.mem_live, 255 * cell_size);
    assert_eq!(run.heap.mem_freed, 300 * cell_size);
    assert!(!run.overflow);
}

/// Test that unreachable cycles are collected
///
/// **Bug this finds:** Reference counting style leaks of cyclic garbage
#[test]
fn test_cyclic_garbage_is_freed() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    let kept = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), 7);
    let root = GcRoot::new(gc, kept).unwrap();
    let a = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), 1);
    let b = new_node(gc, a, std::ptr::null_mut(), 2);
    gc.write_barrier_ptr(field(a, LEFT), b);

    gc.gc(GcOptions::collect()).unwrap();

    assert_alive(gc, root.get(), "rooted node");
    assert_eq!(value(root.get()), 7);
    assert_dead(gc, a, "cycle member a");
    assert_dead(gc, b, "cycle member b");
}

/// Test that a root registered on the thread stack keeps its target alive
#[test]
fn test_stack_root_keeps_object_alive() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    let handle = GcHandle::new(build_tree(gc, 4));
    unsafe { gc.register_root(&handle).unwrap() };
    assert_eq!(gc.static_root_count(), 0);

    gc.gc(GcOptions::collect()).unwrap();

    assert_eq!(tree_size(gc, handle.get()), 15);
    gc.deregister_root(&handle).unwrap();
    assert!(gc.deregister_root(&handle).is_err());
}

/// Test that an uncommitted cell survives and pins what it points to
///
/// **Bug this finds:** Half-constructed objects swept, or their targets
/// moved under them
#[test]
fn test_uncommitted_cell_is_scanned_conservatively() {
    // Arrange: `target` is only referenced from an uncommitted cell
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    make_garbage(gc, 10);
    let target = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), 42);
    let pending = gc.allocate(&AllocRequest::raw(16)).unwrap();
    unsafe { (pending.ptr as *mut usize).write(target as usize) };

    // Act
    gc.gc(GcOptions::collect()).unwrap();

    // Assert: target neither freed nor moved into the garbage holes
    assert_alive(gc, target, "conservatively referenced node");
    assert_eq!(value(target), 42);
    let cell = gc.lookup_cell(pending.ptr).unwrap();
    assert_eq!(cell.cell_start(), pending.cell_start);
    assert!(!cell.is_init());
    gc.commit(&pending).unwrap();
}

/// Test that a registered pin keeps an object in place
///
/// **Bug this finds:** Compactor moving pinned cells
#[test]
fn test_pinned_object_is_not_moved() {
    // Arrange: garbage holes before both nodes, only `moving` is unpinned
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    make_garbage(gc, 40);
    let pinned = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), 1);
    let moving = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), 2);
    let pinned_root = GcRoot::new(gc, pinned).unwrap();
    let moving_root = GcRoot::new(gc, moving).unwrap();
    let pin = gc.register_pin(pinned_root.handle()).unwrap();

    // Act
    let run = gc.gc(GcOptions::collect()).unwrap();

    // Assert
    assert_eq!(pinned_root.get(), pinned);
    assert_ne!(moving_root.get(), moving);
    assert_eq!(value(moving_root.get()), 2);
    assert!(run.heap.mem_copied > 0);
    gc.deregister_pin(pin).unwrap();
}

/// Test that a pin pushed on the pin stack also holds the object in place
#[test]
fn test_pushed_pin_is_not_moved() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    make_garbage(gc, 10);
    let node = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), 5);
    let handle = GcHandle::new(node);

    let pin = gc.push_pin(&handle).unwrap();
    gc.gc(GcOptions::collect()).unwrap();

    assert_alive(gc, pin, "pinned node");
    assert_eq!(value(pin), 5);
    gc.pop_pin(pin).unwrap();
    assert!(gc.pop_pin(pin).is_err());
}

/// Hub in the large object space with more children than the packets hold
struct WideGraph<'gc> {
    hub: GcRoot<'gc>,
    fanout: usize,
}

impl WideGraph<'_> {
    fn child(&self, gc: &GarbageCollector, i: usize) -> *mut u8 {
        gc.read_barrier(field(self.hub.get(), i * 8))
    }
}

fn wide_graph(gc: &GarbageCollector) -> WideGraph<'_> {
    let fanout = 3 * PACKET_SIZE;
    let meta: &'static TypeMeta =
        TypeMeta::leak("Hub", fanout * 8, (0..fanout).map(|i| i * 8).collect()).unwrap();
    let response = gc.allocate(&AllocRequest::of(meta)).unwrap();
    gc.commit(&response).unwrap();
    let hub = GcRoot::new(gc, response.ptr).unwrap();

    for i in 0..fanout {
        let leaf = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), i as u64);
        gc.write_barrier_ptr(field(hub.get(), i * 8), leaf);
    }
    WideGraph { hub, fanout }
}

/// Test that packet overflow falls back to unbounded serial marking
///
/// **Bug this finds:** Objects lost when mark packets run out
#[test]
fn test_overflow_serial_fallback_marks_everything() {
    // Arrange
    let fixture = GcFixture::with_config(GcConfig {
        packet_count: 2,
        overflow_policy: OverflowPolicy::SerialFallback,
        ..test_config()
    });
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    let graph = wide_graph(gc);

    // Act
    let run = gc.gc(GcOptions::collect()).unwrap();

    // Assert
    assert!(run.overflow);
    assert_eq!(run.marked_cells, graph.fanout + 1);
    for i in 0..graph.fanout {
        let child = graph.child(gc, i);
        assert_alive(gc, child, "hub child");
        assert_eq!(value(child), i as u64);
    }
    assert_eq!(gc.stats().snapshot().overflows, 1);
    assert_eq!(gc.phase(), GcPhase::Idle);
}

/// Test that packet overflow under the fail policy aborts the cycle cleanly
///
/// **Bug this finds:** Sweep running on a partial mark, stale mark bits
#[test]
fn test_overflow_fail_policy_reports_error() {
    // Arrange
    let fixture = GcFixture::with_config(GcConfig {
        packet_count: 2,
        overflow_policy: OverflowPolicy::Fail,
        ..test_config()
    });
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    let graph = wide_graph(gc);

    // Act
    let result = gc.gc(GcOptions::collect());

    // Assert: nothing was swept and no mark bit is left behind
    assert!(matches!(result, Err(GcError::MarkingOverflow)));
    assert_eq!(gc.phase(), GcPhase::Idle);
    let hub = gc.lookup_cell(graph.hub.get()).unwrap();
    assert!(!hub.get_mark());
    for i in 0..graph.fanout {
        let child = gc.lookup_cell(graph.child(gc, i)).unwrap();
        assert!(child.is_init());
        assert!(!child.get_mark());
    }
}

/// Test that a reference moved behind the marker's back survives
///
/// **Bug this finds:** Missing write barrier: a white object stored into a
/// black object while its only other reference is erased
#[test]
fn test_write_barrier_preserves_object_moved_during_marking() {
    // Arrange: root -> a -> b
    let fixture = GcFixture::concurrent();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    let b = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), 2);
    let a = new_node(gc, b, std::ptr::null_mut(), 1);
    let root = GcRoot::new(gc, a).unwrap();
    let holder = GcRoot::new(gc, std::ptr::null_mut()).unwrap();

    // Act: move b into a node created during marking, then erase a -> b
    gc.gc(GcOptions::launch_concurrent_mark()).unwrap();
    assert!(gc.marking_in_progress());
    let moved = gc.read_barrier(field(root.get(), LEFT));
    let c = new_node(gc, moved, std::ptr::null_mut(), 3);
    holder.set(c);
    gc.write_barrier_ptr(field(root.get(), LEFT), std::ptr::null_mut());
    gc.gc(GcOptions::collect()).unwrap();

    // Assert
    let c = holder.get();
    assert_eq!(value(c), 3);
    let b = gc.read_barrier(field(c, LEFT));
    assert_alive(gc, b, "object moved during marking");
    assert_eq!(value(b), 2);
    assert!(field(root.get(), LEFT).load(Ordering::Acquire).is_null());
}

/// Test that objects committed during marking are not swept
///
/// **Bug this finds:** Allocation during marking producing white objects
#[test]
fn test_objects_committed_during_marking_survive() {
    let fixture = GcFixture::concurrent();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    gc.gc(GcOptions::launch_concurrent_mark()).unwrap();
    let response = gc.allocate(&AllocRequest::of(&NODE)).unwrap();
    gc.commit(&response).unwrap();
    let root = GcRoot::new(gc, response.ptr).unwrap();
    gc.gc(GcOptions::collect()).unwrap();

    assert_alive(gc, root.get(), "node committed during marking");
}
