//! Relocate Module - Compaction Support
//!
//! Moving collection of small-object chunks:
//!
//! 1. `TwoFingerCompactor` slides live, unpinned cells from the end of a
//!    chunk into dead cells at its start.
//! 2. Every move goes through `Forwarding::create`, which copies the cell
//!    and leaves a forward pointer in the vacated cell's header.
//! 3. The fix pass calls `Forwarding::forward` on every live handle
//!    (roots, pins and object fields) to point it at the new location.
//!
//! Forward pointers live only until the vacated cell is reused.

pub mod compactor;
pub mod forwarding;

pub use compactor::TwoFingerCompactor;
pub use forwarding::Forwarding;
