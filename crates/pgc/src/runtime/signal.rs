//! Signal-Based Thread Suspension
//!
//! Stop-the-world protocol between the collector and mutator threads:
//!
//! ```text
//! collector                         mutator (SIGUSR1 handler)
//! ---------                         -------------------------
//! suspend_thread(t) x N  ------->   pending.call(park)
//! wait_for_world_stop()             park: suspended += 1
//!    barrier.wait(N)     <-------         barrier.notify()
//!                                         event.wait()
//! ... scan / collect ...
//! wait_for_world_start()
//!    event.notify(N)     ------->         suspended -= 1
//!    barrier.wait(N)     <-------         barrier.notify()
//! ```
//!
//! Barrier and event are built on pipes because `read`/`write` are
//! async-signal-safe. Everything the handler touches is either an atomic or
//! a file descriptor; the handler never allocates and never locks.

use std::cell::{Cell, RefCell};
use std::io;
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{GcError, Result};
use crate::runtime::pending_call::PendingCall;
use crate::runtime::thread::ThreadDescriptor;

/// Signal used to suspend mutators
pub const SUSPEND_SIGNAL: libc::c_int = libc::SIGUSR1;

fn pipe() -> Result<(libc::c_int, libc::c_int)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for both descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(GcError::last_os_error("pipe"));
    }
    Ok((fds[0], fds[1]))
}

/// Write `n` bytes, retrying on EINTR. Async-signal-safe.
fn write_bytes(fd: libc::c_int, mut n: usize) {
    let buf = [0u8; 64];
    while n > 0 {
        let chunk = n.min(buf.len());
        // SAFETY: `buf` holds at least `chunk` bytes.
        let written = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, chunk) };
        if written > 0 {
            n -= written as usize;
        } else if written < 0 && errno() != libc::EINTR {
            return;
        }
    }
}

/// Read `n` bytes, retrying on EINTR. Async-signal-safe.
fn read_bytes(fd: libc::c_int, mut n: usize) {
    let mut buf = [0u8; 64];
    while n > 0 {
        let chunk = n.min(buf.len());
        let read = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, chunk) };
        if read > 0 {
            n -= read as usize;
        } else if read == 0 || errno() != libc::EINTR {
            return;
        }
    }
}

fn close_fd(fd: libc::c_int) {
    if unsafe { libc::close(fd) } != 0 {
        log::error!("close({}) failed: {}", fd, io::Error::last_os_error());
    }
}

#[cfg(any(target_os = "linux", target_os = "emscripten"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(target_os = "android")]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno()
}

fn errno() -> libc::c_int {
    unsafe { *errno_location() }
}

fn set_errno(value: libc::c_int) {
    unsafe { *errno_location() = value }
}

/// PipeBarrier - collector waits until N threads notified
pub struct PipeBarrier {
    read_fd: libc::c_int,
    write_fd: libc::c_int,
}

impl PipeBarrier {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        Ok(Self { read_fd, write_fd })
    }

    /// Signal-handler safe
    pub fn notify(&self) {
        write_bytes(self.write_fd, 1);
    }

    /// Block until `n` notifications arrived
    pub fn wait(&self, n: usize) {
        read_bytes(self.read_fd, n);
    }
}

impl Drop for PipeBarrier {
    fn drop(&mut self) {
        close_fd(self.read_fd);
        close_fd(self.write_fd);
    }
}

/// PipeEvent - parked threads wait until the collector releases them
pub struct PipeEvent {
    read_fd: libc::c_int,
    write_fd: libc::c_int,
}

impl PipeEvent {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        Ok(Self { read_fd, write_fd })
    }

    /// Release `n` waiters
    pub fn notify(&self, n: usize) {
        write_bytes(self.write_fd, n);
    }

    /// Signal-handler safe
    pub fn wait(&self) {
        read_bytes(self.read_fd, 1);
    }
}

impl Drop for PipeEvent {
    fn drop(&mut self) {
        close_fd(self.read_fd);
        close_fd(self.write_fd);
    }
}

/// StwControl - counters and primitives of one stop-the-world protocol
pub struct StwControl {
    signaled: AtomicUsize,
    suspended: AtomicUsize,
    barrier: PipeBarrier,
    event: PipeEvent,
}

impl StwControl {
    pub fn new() -> Result<Self> {
        install_handler()?;
        Ok(Self {
            signaled: AtomicUsize::new(0),
            suspended: AtomicUsize::new(0),
            barrier: PipeBarrier::new()?,
            event: PipeEvent::new()?,
        })
    }

    /// Send the suspension signal to `thread`
    pub fn suspend_thread(&self, thread: libc::pthread_t) -> Result<()> {
        self.signaled.fetch_add(1, Ordering::SeqCst);
        // SAFETY: `thread` is a live registered thread; the registry lock is
        // held, so it cannot deregister meanwhile.
        let rc = unsafe { libc::pthread_kill(thread, SUSPEND_SIGNAL) };
        if rc != 0 {
            self.signaled.fetch_sub(1, Ordering::SeqCst);
            return Err(GcError::SystemCall {
                call: "pthread_kill",
                source: io::Error::from_raw_os_error(rc),
            });
        }
        Ok(())
    }

    /// Block until every signaled thread is parked
    pub fn wait_for_world_stop(&self) {
        self.barrier.wait(self.signaled.load(Ordering::SeqCst));
        fence(Ordering::SeqCst);
    }

    /// Release every parked thread and wait until all of them left the handler
    pub fn wait_for_world_start(&self) {
        let count = self.signaled.swap(0, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.event.notify(count);
        self.barrier.wait(count);
    }

    /// Number of threads currently parked
    pub fn threads_suspended(&self) -> usize {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Number of threads signaled since the last world start
    pub fn threads_signaled(&self) -> usize {
        self.signaled.load(Ordering::SeqCst)
    }

    /// Park the calling thread until the world restarts
    ///
    /// Called from the signal handler or from a deferred pending call.
    fn park(&self) {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.barrier.notify();
        self.event.wait();
        self.suspended.fetch_sub(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.barrier.notify();
    }
}

impl std::fmt::Debug for StwControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StwControl")
            .field("signaled", &self.threads_signaled())
            .field("suspended", &self.threads_suspended())
            .finish()
    }
}

/// Thread-local suspension state
///
/// Const-initialized so the signal handler never triggers lazy setup.
pub(crate) struct LocalState {
    pub(crate) pending: PendingCall,
    control: Cell<*const StwControl>,
    descriptor: RefCell<Option<Arc<ThreadDescriptor>>>,
}

impl LocalState {
    /// Park if this thread belongs to a collector
    fn park(&self) {
        let control = self.control.get();
        if !control.is_null() {
            // SAFETY: the pointer is cleared before the control is dropped.
            unsafe { (*control).park() };
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        !self.control.get().is_null()
    }

    /// Bind this thread to `control` and `descriptor`
    pub(crate) fn attach(&self, control: &Arc<StwControl>, descriptor: Arc<ThreadDescriptor>) {
        *self.descriptor.borrow_mut() = Some(descriptor);
        self.control.set(Arc::as_ptr(control));
    }

    pub(crate) fn detach(&self) -> Option<Arc<ThreadDescriptor>> {
        self.control.set(ptr::null());
        self.descriptor.borrow_mut().take()
    }

    /// Descriptor of this thread if it is registered with `control`
    pub(crate) fn descriptor_for(&self, control: &Arc<StwControl>) -> Option<Arc<ThreadDescriptor>> {
        if self.control.get() != Arc::as_ptr(control) {
            return None;
        }
        self.descriptor.borrow().clone()
    }
}

thread_local! {
    static LOCAL: LocalState = const {
        LocalState {
            pending: PendingCall::new(),
            control: Cell::new(ptr::null()),
            descriptor: RefCell::new(None),
        }
    };
}

/// Run `f` with the calling thread's suspension state
pub(crate) fn with_local<R>(f: impl FnOnce(&LocalState) -> R) -> R {
    LOCAL.with(f)
}

/// Run the deferred suspension of the calling thread, if any
pub(crate) fn leave_unsafe(local: &LocalState) {
    local.pending.leave_pending_scope(|| local.park());
}

pub(crate) fn enter_safe(local: &LocalState) {
    local.pending.enter_safe_scope(|| local.park());
}

extern "C" fn handle_suspend(_signal: libc::c_int) {
    let saved = errno();
    let _ = LOCAL.try_with(|local| {
        if local.is_attached() {
            local.pending.call(|| local.park());
        }
    });
    set_errno(saved);
}

static HANDLER: OnceLock<std::result::Result<(), i32>> = OnceLock::new();

/// Install the suspension signal handler once per process
pub fn install_handler() -> Result<()> {
    let installed = HANDLER.get_or_init(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_suspend as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(SUSPEND_SIGNAL, &action, ptr::null_mut()) != 0 {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(0))
        } else {
            Ok(())
        }
    });
    installed.map_err(|code| GcError::SystemCall {
        call: "sigaction",
        source: io::Error::from_raw_os_error(code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pipe_barrier_counts_notifications() {
        let barrier = PipeBarrier::new().unwrap();
        for _ in 0..100 {
            barrier.notify();
        }
        barrier.wait(100);
    }

    #[test]
    fn test_event_releases_waiters() {
        let event = Arc::new(PipeEvent::new().unwrap());
        let barrier = Arc::new(PipeBarrier::new().unwrap());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let event = Arc::clone(&event);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    event.wait();
                    barrier.notify();
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(10));
        event.notify(3);
        barrier.wait(3);
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn test_handler_installs_once() {
        assert!(install_handler().is_ok());
        assert!(install_handler().is_ok());
    }
}
