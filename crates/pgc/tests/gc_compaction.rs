//! GC Compaction Tests
//!
//! These tests verify two-finger compaction and reference fixing:
//! - Live cells slide into holes of their own chunk
//! - Static roots, stack roots and heap fields follow moved objects
//! - Large objects never move but their fields are fixed
//! - Compaction can be switched off

mod common;

use common::{
    assert_list_intact, field, make_garbage, new_node, test_config, value, GcFixture, LEFT, NODE,
};
use pgc::{AllocRequest, GarbageCollector, GcConfig, GcHandle, GcOptions, GcRoot};

/// List of `len` nodes with two garbage nodes after every list node
///
/// The pool ends up a third full, well below the compaction threshold.
fn fragmented_list(gc: &GarbageCollector, len: usize) -> *mut u8 {
    let mut head = std::ptr::null_mut();
    for i in 0..len {
        head = new_node(gc, head, std::ptr::null_mut(), i as u64);
        make_garbage(gc, 2);
    }
    head
}

/// Test that compaction moves live objects and fixes every reference
///
/// **Bug this finds:** Heap fields or roots left pointing at vacated cells
/// **Invariant verified:** The list reads back identically after moving
#[test]
fn test_compaction_moves_objects_and_fixes_references() {
    // Arrange
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    let head = fragmented_list(gc, 48);
    let root = GcRoot::new(gc, head).unwrap();

    // Act
    let run = gc.gc(GcOptions::collect()).unwrap();

    // Assert
    assert!(run.heap.mem_copied > 0);
    assert_ne!(root.get(), head, "head sat at the end of its chunk");
    assert_list_intact(gc, root.get(), 48, "after compaction");
    assert_eq!(run.marked_cells, 48);
}

/// Test that a second cycle over a compacted heap moves nothing
#[test]
fn test_compacted_heap_is_stable() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    let root = GcRoot::new(gc, fragmented_list(gc, 48)).unwrap();
    gc.gc(GcOptions::collect()).unwrap();
    let head = root.get();

    let run = gc.gc(GcOptions::collect()).unwrap();

    assert_eq!(run.heap.mem_copied, 0);
    assert_eq!(run.heap.mem_freed, 0);
    assert_eq!(root.get(), head);
    assert_list_intact(gc, root.get(), 48, "second cycle");
}

/// Test that compaction can be disabled
///
/// **Bug this finds:** `compacting: false` ignored by the pool collector
#[test]
fn test_non_compacting_collector_keeps_addresses() {
    let fixture = GcFixture::with_config(GcConfig {
        compacting: false,
        ..test_config()
    });
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    let head = fragmented_list(gc, 48);
    let root = GcRoot::new(gc, head).unwrap();

    let run = gc.gc(GcOptions::collect()).unwrap();

    assert_eq!(run.heap.mem_copied, 0);
    assert_eq!(root.get(), head);
    assert_list_intact(gc, root.get(), 48, "without compaction");
}

/// Test that a root registered on the thread stack is forwarded
///
/// **Bug this finds:** Thread roots skipped by the fix-up pass
#[test]
fn test_stack_root_is_forwarded() {
    // Arrange: ten holes in front of the node
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    make_garbage(gc, 10);
    let node = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), 99);
    let handle = GcHandle::new(node);
    unsafe { gc.register_root(&handle).unwrap() };

    // Act
    gc.gc(GcOptions::collect()).unwrap();

    // Assert
    assert_ne!(handle.get(), node);
    assert_eq!(value(handle.get()), 99);
    gc.deregister_root(&handle).unwrap();
}

/// Test that large objects stay put while their fields are fixed
///
/// **Bug this finds:** Large object fields not traced by the fix-up pass
#[test]
fn test_large_object_fields_are_fixed() {
    // Arrange: an array of nodes in the large object space points to a
    // small node that will move
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    let array = gc.allocate(&AllocRequest::array(&NODE, 200)).unwrap();
    gc.commit(&array).unwrap();
    let root = GcRoot::new(gc, array.ptr).unwrap();
    make_garbage(gc, 10);
    let node = new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), 11);
    let last = array.ptr.wrapping_add(199 * NODE.size());
    gc.write_barrier_ptr(field(last, LEFT), node);

    // Act
    gc.gc(GcOptions::collect()).unwrap();

    // Assert
    assert_eq!(root.get(), array.ptr);
    let moved = gc.read_barrier(field(last, LEFT));
    assert_ne!(moved, node);
    assert_eq!(value(moved), 11);
}

/// Test that a pool emptied by collection gives its memory back
#[test]
fn test_empty_chunks_are_released() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();
    make_garbage(gc, 500);
    assert!(gc.heap().heap_size() > 0);

    let run = gc.gc(GcOptions::collect()).unwrap();

    assert_eq!(gc.heap().heap_size(), 0);
    assert_eq!(run.heap.mem_live, 0);
    assert_eq!(gc.heap().core().cached_bytes(), 0);
}
