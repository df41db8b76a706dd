//! Runtime Module - Mutator Threads and Safepoints
//!
//! - `pending_call` - deferred suspension state machine
//! - `signal` - SIGUSR1 handler, pipe barrier/event, `StwControl`
//! - `safepoint` - `UnsafeScope` / `SafeScope` guards
//! - `thread` - per-mutator `ThreadDescriptor`
//! - `manager` - thread registry and stop-the-world
//! - `snapshot` - `WorldSnapshot` of the stopped world

pub mod manager;
pub mod pending_call;
pub mod safepoint;
pub mod signal;
pub mod snapshot;
pub mod thread;

pub use manager::ThreadManager;
pub use pending_call::PendingCall;
pub use safepoint::{in_unsafe_scope, unsafe_depth, SafeScope, UnsafeScope};
pub use signal::{install_handler, PipeBarrier, PipeEvent, StwControl, SUSPEND_SIGNAL};
pub use snapshot::WorldSnapshot;
pub use thread::ThreadDescriptor;
