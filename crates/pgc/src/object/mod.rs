//! Object Module - Managed Object Layout
//!
//! - `GcHandle` - atomic reference slot, the unit traced and forwarded
//! - `TypeMeta` - static description of where handles live inside a type
//! - `gc_box` - cell header layout (type meta, object count, forward pointer)
//!
//! Cell layout:
//! ```text
//! +-----------+-------+---------+------------------------------+
//! | type meta | count | forward | object 0 | object 1 | ...     |
//! +-----------+-------+---------+------------------------------+
//! ^ cell start                  ^ object start (returned to mutator)
//! ```

pub mod gc_box;
pub mod handle;
pub mod meta;

pub use handle::GcHandle;
pub use meta::TypeMeta;
