//! Util Module - Shared Utilities
//!
//! Utilities used throughout PGC.

pub mod alignment;
pub mod bitmap;

pub use alignment::Alignment;
pub use bitmap::AtomicBitmap;
