//! Task frames and handles.
//!
//! A task frame is the heap-allocated activation record of a stackless
//! computation: the future produced by an `async` block, a result slot, a
//! waker slot for the frame awaiting it and a non-atomic reference count.
//! Interior awaits inside the future are compiled into the same state
//! machine, so the frame the worker polls is always the stack-bottom of its
//! await chain; every waker derived from it points back at that bottom.
//!
//! Frames never migrate: the worker whose wake list first receives a frame
//! owns it until the count drops to zero.

mod cell;
pub(crate) use cell::TaskCell;

mod handle;
pub use handle::TaskHandle;

mod header;
pub(crate) use header::Lifecycle;

mod raw;
pub(crate) use raw::RawTask;

mod waker;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_not_impl_any;
    use std::future::Future;
    use std::pin::pin;
    use std::task::{Context, Poll};

    // Non-atomic reference counts: handles must never cross threads.
    assert_not_impl_any!(TaskHandle<()>: Send, Sync);
    assert_not_impl_any!(TaskHandle<i32>: Send, Sync);

    fn noop_cx(waker: &std::task::Waker) -> Context<'_> {
        Context::from_waker(waker)
    }

    #[test]
    fn frame_starts_with_one_reference() {
        let _serial = test_support::serial_guard();

        let raw = TaskCell::allocate(async { 7 });
        assert_eq!(raw.header().ref_count(), 1);

        let handle: TaskHandle<i32> = unsafe { TaskHandle::from_raw(raw) };
        let second = handle.clone();
        assert_eq!(raw.header().ref_count(), 2);

        drop(second);
        assert_eq!(raw.header().ref_count(), 1);
        drop(handle);
    }

    #[test]
    fn poll_to_completion_and_read_output() {
        let _serial = test_support::serial_guard();

        let raw = TaskCell::allocate(async { 40 + 2 });
        let handle: TaskHandle<i32> = unsafe { TaskHandle::from_raw(raw) };
        assert!(!handle.is_finished());

        raw.poll();
        assert!(handle.is_finished());

        let waker = futures::task::noop_waker();
        let mut handle = pin!(handle);
        match handle.as_mut().poll(&mut noop_cx(&waker)) {
            Poll::Ready(v) => assert_eq!(v, 42),
            Poll::Pending => panic!("finished task reported pending"),
        }
    }

    #[test]
    fn panic_is_captured_and_re_raised() {
        let _serial = test_support::serial_guard();

        let raw = TaskCell::allocate(async { panic!("boom") });
        let handle: TaskHandle<()> = unsafe { TaskHandle::from_raw(raw) };

        // The unwind stops at the frame boundary.
        raw.poll();
        assert!(handle.is_finished());

        let waker = futures::task::noop_waker();
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut handle = pin!(handle);
            let _ = handle.as_mut().poll(&mut noop_cx(&waker));
        }));
        assert!(caught.is_err(), "handle await must re-raise the panic");
    }

    #[test]
    fn frames_are_freed_when_last_handle_drops() {
        let _serial = test_support::serial_guard();

        let (alloc_before, released_before) = test_support::frame_counts();

        let raw = TaskCell::allocate(async {});
        let handle: TaskHandle<()> = unsafe { TaskHandle::from_raw(raw) };
        raw.poll();
        drop(handle);

        let (allocated, released) = test_support::frame_counts();
        assert_eq!(allocated - alloc_before, 1);
        assert_eq!(released - released_before, 1);
    }
}
