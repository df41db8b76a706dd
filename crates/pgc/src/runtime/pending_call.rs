//! Pending Call - Deferred Suspension State Machine
//!
//! A per-thread reentrant guard that decides whether a suspension request
//! runs now or waits for the thread to leave its unsafe scope.
//!
//! ```text
//!            call(f)
//!   depth == 0 -----> f() runs immediately
//!   depth  > 0 -----> pending = true
//!
//!   leave_pending_scope (depth 1 -> 0) --> pending ? f() : nothing
//!   enter_safe_scope    (depth n -> 0) --> pending ? f() : nothing
//! ```
//!
//! `call` and `call_if_pended` run inside a signal handler: they only touch
//! atomics. The saved-depth stack of safe scopes is never touched by the
//! handler.

use std::cell::RefCell;
use std::sync::atomic::{compiler_fence, AtomicBool, AtomicUsize, Ordering};

/// PendingCall - depth counter plus pending flag
pub struct PendingCall {
    depth: AtomicUsize,
    pending: AtomicBool,
    saved: RefCell<Vec<usize>>,
}

impl PendingCall {
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
            saved: RefCell::new(Vec::new()),
        }
    }

    /// Run `f` now, or defer it if the thread is inside an unsafe scope
    ///
    /// Signal-handler safe.
    pub fn call<F: FnOnce()>(&self, f: F) {
        if self.depth.load(Ordering::SeqCst) > 0 {
            self.pending.store(true, Ordering::SeqCst);
        } else {
            f();
        }
    }

    /// Run `f` if a call was deferred
    pub fn call_if_pended<F: FnOnce()>(&self, f: F) {
        if self.pending.swap(false, Ordering::SeqCst) {
            f();
        }
    }

    /// Enter an unsafe scope (reentrant)
    pub fn enter_pending_scope(&self) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        compiler_fence(Ordering::SeqCst);
    }

    /// Leave an unsafe scope, running the deferred call on the outermost exit
    ///
    /// # Panics
    /// Panics if the thread is not inside an unsafe scope.
    pub fn leave_pending_scope<F: FnOnce()>(&self, f: F) {
        compiler_fence(Ordering::SeqCst);
        let depth = self.depth.load(Ordering::SeqCst);
        assert!(depth > 0, "left an unsafe scope that was never entered");
        if depth > 1 {
            self.depth.store(depth - 1, Ordering::SeqCst);
            return;
        }
        self.depth.store(0, Ordering::SeqCst);
        self.call_if_pended(f);
    }

    /// Temporarily allow suspension, delivering any deferred call now
    pub fn enter_safe_scope<F: FnOnce()>(&self, f: F) {
        let depth = self.depth.load(Ordering::SeqCst);
        self.saved.borrow_mut().push(depth);
        self.depth.store(0, Ordering::SeqCst);
        compiler_fence(Ordering::SeqCst);
        self.call_if_pended(f);
    }

    /// Restore the depth saved by the matching `enter_safe_scope`
    ///
    /// # Panics
    /// Panics if no safe scope is active.
    pub fn leave_safe_scope(&self) {
        let depth = self.saved.borrow_mut().pop();
        let depth = depth.unwrap_or_else(|| panic!("left a safe scope that was never entered"));
        compiler_fence(Ordering::SeqCst);
        self.depth.store(depth, Ordering::SeqCst);
    }

    /// Check if the thread is inside an unsafe scope
    pub fn is_locked(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Default for PendingCall {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("depth", &self.depth())
            .field("pending", &self.is_pending())
            .finish()
    }
}
