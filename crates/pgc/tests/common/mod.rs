//! Test Utilities for the PGC Test Suite
//!
//! Fixtures, a small object model and strict assertion helpers shared by
//! the integration tests.
//!
//! ============================================================================
//! Objects built here are only reachable through registered roots. Raw
//! pointers held in locals are valid only until the next collection.
//! ============================================================================

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pgc::{AllocRequest, GarbageCollector, GcConfig, GcHandle, TypeMeta};

/// Initial heap limit for tests (16MB)
pub const TEST_HEAP_LIMIT: usize = 16 * 1024 * 1024;

/// Maximum heap size for tests (64MB)
pub const TEST_MAX_HEAP: usize = 64 * 1024 * 1024;

/// Maximum test duration before timeout
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Offset of `Node::left`
pub const LEFT: usize = 0;
/// Offset of `Node::right`
pub const RIGHT: usize = 8;
/// Offset of `Node::value`
pub const VALUE: usize = 16;

/// `struct Node { left: GcHandle, right: GcHandle, value: u64 }`
pub static NODE: TypeMeta = TypeMeta::new("Node", 24, &[LEFT, RIGHT]);

/// `struct Blob { data: [u64; 2] }`, no references
pub static BLOB: TypeMeta = TypeMeta::new("Blob", 16, &[]);

/// ============================================================================
/// GC FIXTURE
/// ============================================================================

/// Test fixture owning one collector
pub struct GcFixture {
    pub gc: Arc<GarbageCollector>,
    pub config: GcConfig,
}

impl GcFixture {
    /// Serial (non-concurrent) collector
    ///
    /// **Bug this finds:** Configuration validation bugs, initialization failures
    pub fn serial() -> Self {
        Self::with_config(test_config())
    }

    /// Collector with concurrent marking enabled
    pub fn concurrent() -> Self {
        Self::with_config(GcConfig {
            concurrent: true,
            ..test_config()
        })
    }

    pub fn with_config(config: GcConfig) -> Self {
        let gc = Arc::new(
            GarbageCollector::new(config.clone())
                .expect("GC initialization should succeed with valid config"),
        );
        Self { gc, config }
    }
}

/// Baseline configuration: serial, two collector threads, roomy heap
pub fn test_config() -> GcConfig {
    GcConfig {
        initial_heap_limit: TEST_HEAP_LIMIT,
        max_heap_size: TEST_MAX_HEAP,
        gc_threads: 2,
        concurrent: false,
        verbose: false,
        ..Default::default()
    }
}

/// ============================================================================
/// OBJECT MODEL
/// ============================================================================

/// Handle stored at `offset` inside the object at `obj`
pub fn field<'a>(obj: *mut u8, offset: usize) -> &'a GcHandle {
    // SAFETY: callers pass live objects laid out by NODE.
    unsafe { GcHandle::from_address(obj as usize + offset) }
}

pub fn value(obj: *mut u8) -> u64 {
    // SAFETY: callers pass live objects laid out by NODE.
    unsafe { (obj.add(VALUE) as *const u64).read() }
}

/// Allocate, initialize and commit one node
///
/// The calling thread must be registered.
pub fn new_node(gc: &GarbageCollector, left: *mut u8, right: *mut u8, value: u64) -> *mut u8 {
    let response = gc
        .allocate(&AllocRequest::of(&NODE))
        .expect("node allocation should succeed");
    gc.write_barrier_ptr(field(response.ptr, LEFT), left);
    gc.write_barrier_ptr(field(response.ptr, RIGHT), right);
    // SAFETY: the cell is ours until commit.
    unsafe { (response.ptr.add(VALUE) as *mut u64).write(value) };
    gc.commit(&response).expect("commit should succeed");
    response.ptr
}

/// Singly linked list through `left`; values `len-1` down to `0`
///
/// Returns the head.
pub fn build_list(gc: &GarbageCollector, len: usize) -> *mut u8 {
    let mut head = std::ptr::null_mut();
    for i in 0..len {
        head = new_node(gc, head, std::ptr::null_mut(), i as u64);
    }
    head
}

/// Values of the list starting at `head`
pub fn list_values(gc: &GarbageCollector, head: *mut u8) -> Vec<u64> {
    let mut values = Vec::new();
    let mut node = head;
    while !node.is_null() {
        values.push(value(node));
        node = gc.read_barrier(field(node, LEFT));
    }
    values
}

/// Complete binary tree of `depth` levels; node values are heap indices
pub fn build_tree(gc: &GarbageCollector, depth: u32) -> *mut u8 {
    fn build(gc: &GarbageCollector, idx: u64, depth: u32) -> *mut u8 {
        if depth == 0 {
            return std::ptr::null_mut();
        }
        let left = build(gc, 2 * idx + 1, depth - 1);
        let right = build(gc, 2 * idx + 2, depth - 1);
        new_node(gc, left, right, idx)
    }
    build(gc, 0, depth)
}

pub fn tree_size(gc: &GarbageCollector, node: *mut u8) -> usize {
    if node.is_null() {
        return 0;
    }
    let left = gc.read_barrier(field(node, LEFT));
    let right = gc.read_barrier(field(node, RIGHT));
    1 + tree_size(gc, left) + tree_size(gc, right)
}

/// Allocate `count` unreachable nodes
pub fn make_garbage(gc: &GarbageCollector, count: usize) {
    for i in 0..count {
        new_node(gc, std::ptr::null_mut(), std::ptr::null_mut(), i as u64);
    }
}

/// ============================================================================
/// STRICT ASSERTION HELPERS
/// ============================================================================

/// Assert that all addresses are unique
///
/// **Bug this finds:** Freelist corruption, double hand-out of a cell
pub fn assert_all_addresses_unique(addresses: &[usize], context: &str) {
    let unique: HashSet<_> = addresses.iter().collect();
    assert_eq!(
        unique.len(),
        addresses.len(),
        "{}: {} duplicate addresses",
        context,
        addresses.len() - unique.len()
    );
}

/// Assert that the list at `head` holds `len-1, ..., 0`
///
/// **Bug this finds:** Lost objects, stale references after compaction
pub fn assert_list_intact(gc: &GarbageCollector, head: *mut u8, len: usize, context: &str) {
    let expected: Vec<u64> = (0..len as u64).rev().collect();
    assert_eq!(list_values(gc, head), expected, "{}: list corrupted", context);
}

/// Assert that `ptr` is a committed heap object
pub fn assert_alive(gc: &GarbageCollector, ptr: *mut u8, context: &str) {
    let cell = gc
        .lookup_cell(ptr)
        .unwrap_or_else(|| panic!("{}: {:p} is not in the heap", context, ptr));
    assert!(cell.is_init(), "{}: {:p} is not committed", context, ptr);
}

/// Assert that `ptr` no longer holds a committed object
pub fn assert_dead(gc: &GarbageCollector, ptr: *mut u8, context: &str) {
    assert!(
        gc.lookup_cell(ptr).map_or(true, |cell| !cell.is_init()),
        "{}: {:p} survived collection",
        context,
        ptr
    );
}
