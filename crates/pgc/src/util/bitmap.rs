//! Atomic Bitmap - Per-Cell Flags
//!
//! Bitmap used by chunk descriptors to track mark, pin and init flags.
//! One bit per cell, packed into `AtomicU64` words so that marker threads
//! and mutators can flip bits concurrently.
//!
//! ```text
//! Chunk: 128 cells
//! Words: 128 / 64 = 2
//!
//! Cell 70:
//! - Word index: 70 / 64 = 1
//! - Bit offset: 70 % 64 = 6
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

/// AtomicBitmap - fixed-size concurrent bitmap
pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitmap {
    /// Create a cleared bitmap with `len` bits
    pub fn new(len: usize) -> Self {
        let word_count = (len + WORD_BITS - 1) / WORD_BITS;
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the bitmap has no bits at all
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn locate(&self, idx: usize) -> (usize, u64) {
        debug_assert!(idx < self.len, "bit {} out of range {}", idx, self.len);
        (idx / WORD_BITS, 1u64 << (idx % WORD_BITS))
    }

    /// Read bit `idx`
    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        let (word, mask) = self.locate(idx);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Write bit `idx`
    #[inline]
    pub fn set(&self, idx: usize, value: bool) {
        let (word, mask) = self.locate(idx);
        if value {
            self.words[word].fetch_or(mask, Ordering::AcqRel);
        } else {
            self.words[word].fetch_and(!mask, Ordering::AcqRel);
        }
    }

    /// Set bit `idx` and return its previous value
    #[inline]
    pub fn test_and_set(&self, idx: usize) -> bool {
        let (word, mask) = self.locate(idx);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clear every bit
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Count set bits
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Check if any bit is set
    pub fn any(&self) -> bool {
        self.words
            .iter()
            .any(|word| word.load(Ordering::Acquire) != 0)
    }
}

impl std::fmt::Debug for AtomicBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBitmap")
            .field("len", &self.len)
            .field("ones", &self.count_ones())
            .finish()
    }
}
