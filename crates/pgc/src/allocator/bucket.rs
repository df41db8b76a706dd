//! Size Classes
//!
//! Power-of-two buckets from `MIN_CELL_SIZE` to `LARGE_CELL_SIZE`. Larger
//! cells go to the large-object allocator.
//!
//! ```text
//! bucket:     0    1    2     3     4     5     6     7
//! cell size:  32   64   128   256   512   1024  2048  4096
//! ```

use crate::heap::sys::align_to_page;

/// Smallest cell size
pub const MIN_CELL_SIZE: usize = 32;
/// Largest small-object cell size
pub const LARGE_CELL_SIZE: usize = 4096;
/// Number of size classes
pub const BUCKET_COUNT: usize =
    (LARGE_CELL_SIZE.trailing_zeros() - MIN_CELL_SIZE.trailing_zeros()) as usize + 1;

/// Minimum number of cells per chunk
const MIN_CELLS_PER_CHUNK: usize = 32;

/// Size class for a cell of `box_size` bytes, or None for large objects
pub fn bucket_index(box_size: usize) -> Option<usize> {
    if box_size > LARGE_CELL_SIZE {
        return None;
    }
    let cell = box_size.max(MIN_CELL_SIZE).next_power_of_two();
    Some((cell.trailing_zeros() - MIN_CELL_SIZE.trailing_zeros()) as usize)
}

/// Cell size of bucket `idx`
pub fn bucket_cell_size(idx: usize) -> usize {
    MIN_CELL_SIZE << idx
}

/// Chunk size requested from the core allocator for `cell_size` cells
pub fn chunk_size(cell_size: usize) -> usize {
    align_to_page(cell_size * MIN_CELLS_PER_CHUNK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(BUCKET_COUNT, 8);
        assert_eq!(bucket_index(1), Some(0));
        assert_eq!(bucket_index(32), Some(0));
        assert_eq!(bucket_index(33), Some(1));
        assert_eq!(bucket_index(4096), Some(7));
        assert_eq!(bucket_index(4097), None);
    }

    #[test]
    fn test_cell_size_fits_request() {
        for size in [1, 24, 40, 100, 1000, 4096] {
            let idx = bucket_index(size).unwrap();
            assert!(bucket_cell_size(idx) >= size);
            assert!(chunk_size(bucket_cell_size(idx)) >= MIN_CELLS_PER_CHUNK * bucket_cell_size(idx));
        }
    }
}
