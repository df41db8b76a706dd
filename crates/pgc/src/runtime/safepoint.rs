//! Safepoint Scopes
//!
//! RAII guards over the calling thread's pending-call state:
//!
//! - `UnsafeScope` - suspension is deferred until the outermost scope exits
//! - `SafeScope` - suspension is allowed again inside an unsafe region;
//!   a deferred suspension is delivered on entry
//!
//! Both guards are `!Send`: they must be dropped on the thread that
//! created them.

use std::marker::PhantomData;

use crate::runtime::signal::{enter_safe, leave_unsafe, with_local};

/// Guard that defers suspension of the current thread
///
/// # Examples
///
/// ```rust
/// use pgc::runtime::UnsafeScope;
///
/// {
///     let _scope = UnsafeScope::enter();
///     // multi-step pointer construction
/// }
/// ```
#[must_use = "the scope ends when the guard is dropped"]
pub struct UnsafeScope {
    _not_send: PhantomData<*const ()>,
}

impl UnsafeScope {
    pub fn enter() -> Self {
        with_local(|local| local.pending.enter_pending_scope());
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for UnsafeScope {
    fn drop(&mut self) {
        with_local(leave_unsafe);
    }
}

/// Guard that re-enables suspension inside an unsafe region
#[must_use = "the scope ends when the guard is dropped"]
pub struct SafeScope {
    _not_send: PhantomData<*const ()>,
}

impl SafeScope {
    pub fn enter() -> Self {
        with_local(enter_safe);
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for SafeScope {
    fn drop(&mut self) {
        with_local(|local| local.pending.leave_safe_scope());
    }
}

/// Nesting depth of unsafe scopes on the current thread
pub fn unsafe_depth() -> usize {
    with_local(|local| local.pending.depth())
}

/// Check if suspension of the current thread is deferred
pub fn in_unsafe_scope() -> bool {
    unsafe_depth() > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsafe_scopes_nest() {
        assert_eq!(unsafe_depth(), 0);
        {
            let _outer = UnsafeScope::enter();
            {
                let _inner = UnsafeScope::enter();
                assert_eq!(unsafe_depth(), 2);
            }
            assert!(in_unsafe_scope());
        }
        assert!(!in_unsafe_scope());
    }

    #[test]
    fn test_safe_scope_restores_depth() {
        let _outer = UnsafeScope::enter();
        let _inner = UnsafeScope::enter();
        {
            let _safe = SafeScope::enter();
            assert_eq!(unsafe_depth(), 0);
            {
                let _nested = UnsafeScope::enter();
                assert_eq!(unsafe_depth(), 1);
            }
        }
        assert_eq!(unsafe_depth(), 2);
    }
}
