//! Two-Finger Compaction
//!
//! Compacts one chunk of fixed-size cells in a single pass:
//!
//! ```text
//!   to ->                                   <- from
//! [L][ ][L][ ][ ][P][ ][L][L][ ][L]
//!     ^                          ^
//!     first dead cell            last movable live cell
//! ```
//!
//! `to` walks forward over live cells, `from` walks backward over dead and
//! pinned cells. While `from` is after `to` the cell at `from` moves into
//! the hole at `to`. Pinned cells are never moved. Chunks are compacted
//! independently; cells never move across chunks.

use crate::allocator::PoolDescriptor;
use crate::relocate::Forwarding;
use crate::stats::HeapStat;

/// TwoFingerCompactor - per-chunk sliding compaction
pub struct TwoFingerCompactor;

impl TwoFingerCompactor {
    /// Compact `chunk`, recording every move in `forwarding`
    ///
    /// Dead objects overwritten by a move are counted in `mem_freed`, moved
    /// bytes in `mem_copied`. Dead cells left behind are handled by the
    /// caller's sweep.
    pub fn compact(chunk: &PoolDescriptor, forwarding: &Forwarding, stat: &mut HeapStat) {
        let cell_size = chunk.cell_bytes();
        let mut to = 0;
        let mut from = chunk.cell_count();
        let mut moved = 0usize;

        loop {
            while to < from && (chunk.mark_at(to) || chunk.pin_at(to)) {
                to += 1;
            }
            while from > to && !(chunk.mark_at(from - 1) && !chunk.pin_at(from - 1)) {
                from -= 1;
            }
            if from <= to {
                break;
            }

            let src = chunk.gc_cell(from - 1);
            let dst = chunk.gc_cell(to);
            if chunk.init_at(to) {
                stat.mem_freed += cell_size;
            }

            forwarding.create(src, dst);
            dst.commit();
            dst.set_pin(false);
            dst.set_mark(true);
            src.finalize();

            stat.mem_copied += cell_size;
            moved += 1;
            to += 1;
            from -= 1;
        }

        log::trace!(
            "compacted chunk {:#x}: {} cells moved",
            chunk.base(),
            moved
        );
    }
}
