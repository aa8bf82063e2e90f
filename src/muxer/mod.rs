//! The kernel completion queue abstraction: an io_uring instance on Linux,
//! an I/O completion port on Windows.
//!
//! Both backends expose the same worker-facing surface: `pump` performs one
//! bounded wait on the queue and drains every completion that is already
//! available, writing each one's result into its [`Completion`] record and
//! waking the task recorded there; `post_wakeup` drops a null-tagged no-op
//! onto the queue so a blocked `pump` returns promptly.

use std::cell::{Cell, RefCell};
use std::io;
use std::marker::PhantomPinned;
use std::task::Waker;

#[cfg(target_os = "linux")]
mod uring;
#[cfg(target_os = "linux")]
pub(crate) use uring::Muxer;

#[cfg(windows)]
mod iocp;
#[cfg(windows)]
pub(crate) use iocp::Muxer;

/// One in-flight kernel operation.
///
/// The record's address is the opaque tag handed to the kernel (`user_data`
/// on Linux, the `OVERLAPPED` pointer on Windows), so it must stay pinned
/// for the whole in-flight window. It lives inside the op-future, which is
/// `!Unpin` and itself lives inside a pinned task frame; the frame cannot be
/// freed while suspended, which keeps the address stable.
///
/// Exactly one writer (the worker draining the queue) fills the record, and
/// exactly one reader (the op-future's resume) consumes it, in that order.
#[repr(C)]
pub(crate) struct Completion {
    /// Kernel-owned overlapped block. Must be the first field: the pointer
    /// the completion port returns is cast straight back to `Completion`.
    #[cfg(windows)]
    overlapped: std::cell::UnsafeCell<windows_sys::Win32::System::IO::OVERLAPPED>,

    /// Operation result: bytes transferred, or a negative errno.
    #[cfg(target_os = "linux")]
    result: Cell<i32>,

    /// CQE flags, unused by single-shot operations but recorded anyway.
    #[cfg(target_os = "linux")]
    flags: Cell<u32>,

    /// OS error code of the finished operation, zero on success.
    #[cfg(windows)]
    error: Cell<u32>,

    #[cfg(windows)]
    transferred: Cell<u32>,

    /// True from arm time until the worker observes the completion.
    armed: Cell<bool>,

    ready: Cell<bool>,

    /// The frame to resume: always a stack-bottom, because op-futures only
    /// ever see stack-bottom wakers.
    waker: RefCell<Option<Waker>>,

    _pinned: PhantomPinned,
}

impl Completion {
    pub(crate) fn new() -> Completion {
        Completion {
            #[cfg(windows)]
            overlapped: std::cell::UnsafeCell::new(unsafe { std::mem::zeroed() }),
            #[cfg(target_os = "linux")]
            result: Cell::new(0),
            #[cfg(target_os = "linux")]
            flags: Cell::new(0),
            #[cfg(windows)]
            error: Cell::new(0),
            #[cfg(windows)]
            transferred: Cell::new(0),
            armed: Cell::new(false),
            ready: Cell::new(false),
            waker: RefCell::new(None),
            _pinned: PhantomPinned,
        }
    }

    /// Prepares the record for one kernel request: stores the waker of the
    /// awaiting frame and marks the record in flight.
    pub(crate) fn arm(&self, waker: &Waker) {
        debug_assert!(!self.armed.get(), "completion record armed twice");

        #[cfg(windows)]
        unsafe {
            *self.overlapped.get() = std::mem::zeroed();
        }

        *self.waker.borrow_mut() = Some(waker.clone());
        self.ready.set(false);
        self.armed.set(true);
    }

    /// Rolls back `arm` when the OS request could not be issued (or finished
    /// inline): there is nothing in flight for the worker to complete.
    pub(crate) fn disarm(&self) {
        self.armed.set(false);
        self.waker.borrow_mut().take();
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.get()
    }

    /// Re-registers a waker while the operation is still pending. Spurious
    /// polls may carry a fresh waker for the same frame.
    pub(crate) fn update_waker(&self, waker: &Waker) {
        let mut slot = self.waker.borrow_mut();
        if let Some(current) = &*slot {
            if current.will_wake(waker) {
                return;
            }
        }
        *slot = Some(waker.clone());
    }

    fn take_waker(&self) -> Option<Waker> {
        self.waker.borrow_mut().take()
    }

    /// The opaque tag passed to the kernel.
    #[cfg(target_os = "linux")]
    pub(crate) fn user_data(&self) -> u64 {
        self as *const Completion as usize as u64
    }

    #[cfg(windows)]
    pub(crate) fn overlapped_ptr(&self) -> *mut windows_sys::Win32::System::IO::OVERLAPPED {
        self.overlapped.get()
    }

    /// Worker-side: record the operation's outcome and wake the frame that
    /// is suspended on it. The result is visible to the frame before it is
    /// resumed, because resumption only happens after the drain pass ends.
    #[cfg(target_os = "linux")]
    pub(crate) fn fill(&self, result: i32, flags: u32) {
        self.result.set(result);
        self.flags.set(flags);
        self.finish();
    }

    #[cfg(windows)]
    pub(crate) fn fill(&self, error: u32, transferred: u32) {
        self.error.set(error);
        self.transferred.set(transferred);
        self.finish();
    }

    fn finish(&self) {
        self.armed.set(false);
        self.ready.set(true);
        if let Some(waker) = self.take_waker() {
            waker.wake();
        }
    }

    /// Raw io_uring result of the finished operation: payload for results
    /// that carry more than a byte count (the accepted fd, for instance).
    #[cfg(target_os = "linux")]
    pub(crate) fn os_result(&self) -> i32 {
        debug_assert!(self.ready.get());
        self.result.get()
    }

    /// The finished operation as bytes-or-error.
    pub(crate) fn io_result(&self) -> io::Result<u32> {
        debug_assert!(self.ready.get());

        #[cfg(target_os = "linux")]
        {
            let res = self.result.get();
            if res >= 0 {
                Ok(res as u32)
            } else {
                Err(io::Error::from_raw_os_error(-res))
            }
        }

        #[cfg(windows)]
        {
            let error = self.error.get();
            if error == 0 {
                Ok(self.transferred.get())
            } else {
                Err(io::Error::from_raw_os_error(error as i32))
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // The kernel still holds this record's address. Freeing it now would
        // let a late completion scribble over reclaimed memory; aborting is
        // the only sound answer. Reached only by dropping an op-future
        // mid-flight, which the runtime does not support.
        if self.armed.get() {
            tracing::error!("completion record dropped while its operation is in flight");
            std::process::abort();
        }
    }
}
