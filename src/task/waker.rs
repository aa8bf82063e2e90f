use crate::task::header::Header;
use crate::task::RawTask;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops;
use std::ptr::NonNull;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Borrowed waker for the duration of one poll. Avoids touching the
/// reference count when the future never clones the waker.
pub(super) struct WakerRef<'a> {
    waker: ManuallyDrop<Waker>,
    _p: PhantomData<&'a Header>,
}

/// Builds the waker passed to a frame's future. Its data pointer is the
/// frame header itself: waking it is exactly "enqueue this stack-bottom on
/// its worker".
///
/// Wrapped in `ManuallyDrop` because the returned waker borrows the header
/// without owning a reference; `drop` must never run on it.
pub(super) fn poll_waker(header: NonNull<Header>) -> WakerRef<'static> {
    let waker = unsafe { ManuallyDrop::new(Waker::from_raw(raw_waker(header))) };
    WakerRef {
        waker,
        _p: PhantomData,
    }
}

impl ops::Deref for WakerRef<'_> {
    type Target = Waker;

    fn deref(&self) -> &Waker {
        &self.waker
    }
}

unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
    let header = unsafe { NonNull::new_unchecked(ptr as *mut Header) };
    unsafe { header.as_ref() }.ref_inc();
    raw_waker(header)
}

unsafe fn drop_waker(ptr: *const ()) {
    let header = unsafe { NonNull::new_unchecked(ptr as *mut Header) };
    RawTask::from_ptr(header).drop_reference();
}

// Wake by consuming the waker.
unsafe fn wake_by_val(ptr: *const ()) {
    let header = unsafe { NonNull::new_unchecked(ptr as *mut Header) };
    let raw = RawTask::from_ptr(header);
    raw.wake();
    // The wake list holds no reference of its own; the frame stays alive
    // through the detached reference its worker owns until it is done.
    raw.drop_reference();
}

// Wake without consuming the waker.
unsafe fn wake_by_ref(ptr: *const ()) {
    let header = unsafe { NonNull::new_unchecked(ptr as *mut Header) };
    RawTask::from_ptr(header).wake();
}

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_by_val, wake_by_ref, drop_waker);

fn raw_waker(header: NonNull<Header>) -> RawWaker {
    RawWaker::new(header.as_ptr() as *const (), &WAKER_VTABLE)
}
