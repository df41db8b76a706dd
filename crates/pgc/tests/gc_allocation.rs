//! GC Allocation Tests
//!
//! These tests verify the allocation protocol:
//! - Size classes and the large object threshold
//! - Commit / abort of uninitialized cells
//! - Collection and heap expansion on a full heap
//! - Out-of-memory reporting

mod common;

use common::{assert_all_addresses_unique, test_config, GcFixture, BLOB, NODE};
use pgc::allocator::LARGE_CELL_SIZE;
use pgc::index::MemoryRef;
use pgc::logging::{self, GcEvent};
use pgc::{AllocRequest, GcConfig, GcError, GcRoot};

const MB: usize = 1024 * 1024;

/// Test that small allocations never overlap
///
/// **Bug this finds:** Bump pointer or freelist handing out a cell twice
#[test]
fn test_small_allocations_unique_and_aligned() {
    // Arrange
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    // Act
    let mut addresses = Vec::new();
    for _ in 0..2000 {
        let response = gc.allocate(&AllocRequest::of(&BLOB)).unwrap();
        gc.commit(&response).unwrap();
        addresses.push(response.ptr as usize);
    }

    // Assert
    assert_all_addresses_unique(&addresses, "small allocations");
    for &addr in &addresses {
        assert_eq!(addr % 8, 0, "object at {:#x} is not word aligned", addr);
    }
}

/// Test that every request fits its cell
///
/// **Bug this finds:** Size class rounding down, header not accounted for
#[test]
fn test_cell_fits_request() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    for size in [1, 8, 24, 100, 500, 2000, 4000] {
        let req = AllocRequest::raw(size);
        let response = gc.allocate(&req).unwrap();

        assert!(response.cell_size >= req.box_size().unwrap(), "size {}", size);
        assert!(response.cell_size.is_power_of_two(), "size {}", size);
        assert!(matches!(response.memory, MemoryRef::Pool(_)), "size {}", size);
        gc.commit(&response).unwrap();
    }
}

/// Test that objects above the largest size class bypass the TLAB
///
/// **Bug this finds:** Large objects landing in a size-class pool
#[test]
fn test_large_allocation_uses_large_object_allocator() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    let response = gc.allocate(&AllocRequest::raw(LARGE_CELL_SIZE)).unwrap();
    gc.commit(&response).unwrap();

    assert!(matches!(response.memory, MemoryRef::Large(_)));
    assert_eq!(gc.heap().loa().len(), 1);
    let interior = response.ptr.wrapping_add(LARGE_CELL_SIZE - 1);
    assert_eq!(
        gc.lookup_cell(interior).unwrap().cell_start(),
        response.cell_start
    );
}

/// Test that an aborted cell is reused by the next allocation
///
/// **Bug this finds:** Aborted cells leaking until the next collection
#[test]
fn test_abort_returns_cell() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    let first = gc.allocate(&AllocRequest::of(&NODE)).unwrap();
    gc.abort(&first).unwrap();
    let second = gc.allocate(&AllocRequest::of(&NODE)).unwrap();

    assert_eq!(first.cell_start, second.cell_start);
    gc.commit(&second).unwrap();
}

/// Test that commit is accepted exactly once
///
/// **Bug this finds:** Uncommitted-cell bookkeeping drifting from reality
#[test]
fn test_commit_twice_is_protocol_violation() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    let response = gc.allocate(&AllocRequest::of(&NODE)).unwrap();
    gc.commit(&response).unwrap();

    assert!(matches!(
        gc.commit(&response),
        Err(GcError::ProtocolViolation(_))
    ));
    assert!(matches!(
        gc.abort(&response),
        Err(GcError::ProtocolViolation(_))
    ));
}

/// Test that type metadata can be attached at commit time
#[test]
fn test_commit_with_meta() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    let response = gc.allocate(&AllocRequest::raw(NODE.size())).unwrap();
    gc.commit_with_meta(&response, &NODE).unwrap();

    let cell = gc.lookup_cell(response.ptr).unwrap();
    assert_eq!(cell.type_meta().map(|meta| meta.name()), Some("Node"));
}

/// Test that a heap at its maximum reports OutOfMemory
///
/// **Bug this finds:** Infinite collect/retry loop on a full heap
#[test]
fn test_out_of_memory_after_collection() {
    // Arrange
    let fixture = GcFixture::with_config(GcConfig {
        initial_heap_limit: MB,
        max_heap_size: MB,
        ..test_config()
    });
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    // Act
    let result = gc.allocate(&AllocRequest::raw(2 * MB));

    // Assert
    assert!(matches!(result, Err(GcError::OutOfMemory { .. })));
    assert_eq!(gc.cycle_count(), 1, "one collection before giving up");
    assert!(logging::recent_events()
        .iter()
        .any(|event| matches!(event, GcEvent::AllocationFailure { .. })));
}

/// Test that array requests beyond the address space are rejected
///
/// **Bug this finds:** Cell size arithmetic wrapping to a tiny cell that
/// the array then overruns
#[test]
fn test_oversized_array_request_is_rejected() {
    // Arrange
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    // Act
    let wrapped = gc.allocate(&AllocRequest {
        size: 16,
        count: usize::MAX / 8,
        meta: None,
    });
    let typed = gc.allocate(&AllocRequest::array(&NODE, usize::MAX / 16));

    // Assert: rejected up front, no collection attempted
    assert!(matches!(wrapped, Err(GcError::InvalidArgument(_))));
    assert!(matches!(typed, Err(GcError::InvalidArgument(_))));
    assert_eq!(gc.cycle_count(), 0);
    assert_eq!(gc.heap().heap_size(), 0);
}

/// Test that a request larger than the maximum heap fails cleanly
#[test]
fn test_request_beyond_max_heap_is_out_of_memory() {
    let fixture = GcFixture::serial();
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    let result = gc.allocate(&AllocRequest::raw(usize::MAX / 2));

    assert!(matches!(result, Err(GcError::OutOfMemory { .. })));
    assert_eq!(gc.heap().heap_size(), 0);
}

/// Test that a full heap of live objects is expanded
///
/// **Bug this finds:** Expansion skipped after a collection frees nothing
#[test]
fn test_heap_expands_when_collection_frees_nothing() {
    // Arrange: one rooted block fills most of the heap
    let fixture = GcFixture::with_config(GcConfig {
        initial_heap_limit: MB,
        max_heap_size: 8 * MB,
        ..test_config()
    });
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    let first = gc.allocate(&AllocRequest::raw(768 * 1024)).unwrap();
    gc.commit(&first).unwrap();
    let root = GcRoot::new(gc, first.ptr).unwrap();

    // Act
    let second = gc.allocate(&AllocRequest::raw(768 * 1024)).unwrap();
    gc.commit(&second).unwrap();

    // Assert
    assert_eq!(gc.cycle_count(), 1);
    assert_eq!(gc.heap().heap_limit(), 2 * MB);
    assert_eq!(root.get(), first.ptr);
    assert!(gc.lookup_cell(first.ptr).unwrap().is_init());
}

/// Test that a collection makes room for new objects
#[test]
fn test_collection_reclaims_space_for_allocation() {
    let fixture = GcFixture::with_config(GcConfig {
        initial_heap_limit: MB,
        max_heap_size: MB,
        ..test_config()
    });
    let gc = &fixture.gc;
    let _mutator = gc.register_thread().unwrap();

    // Unrooted blocks: every allocation past the limit collects the previous ones
    for _ in 0..8 {
        let response = gc.allocate(&AllocRequest::raw(600 * 1024)).unwrap();
        gc.commit(&response).unwrap();
    }

    assert!(gc.cycle_count() >= 7);
    assert_eq!(gc.heap().heap_limit(), MB);
}

/// Test that allocation requires a registered thread
#[test]
fn test_allocation_from_unregistered_thread_fails() {
    let fixture = GcFixture::serial();

    let result = fixture.gc.allocate(&AllocRequest::of(&NODE));

    assert!(matches!(result, Err(GcError::ProtocolViolation(_))));
}
