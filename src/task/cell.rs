use crate::task::header::{Header, Lifecycle};
use crate::task::waker::poll_waker;
use crate::task::RawTask;
use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll, Waker};

/// Function table for one concrete future type. Everything the runtime does
/// to a frame after creation goes through these, so the rest of the crate
/// only ever sees thin `*mut Header` pointers.
pub(crate) struct Vtable {
    /// Polls the stored future once, capturing panics into the result slot.
    pub(super) poll: unsafe fn(NonNull<Header>),

    /// Frees the allocation. Only called when the reference count hits zero.
    pub(super) dealloc: unsafe fn(NonNull<Header>),

    /// Moves the finished result into `dst` (a `*mut Poll<F::Output>`), or
    /// stores `waker` to be notified on completion. Re-raises a captured
    /// panic into the caller.
    pub(super) try_read_output: unsafe fn(NonNull<Header>, *mut (), &Waker),
}

/// What currently occupies the frame's storage.
enum Stage<F: Future> {
    /// The future itself, while it still has work to do.
    Pending(F),
    /// The result slot: output of the future, or the captured panic payload
    /// if the task body unwound.
    Finished(Result<F::Output, Box<dyn Any + Send + 'static>>),
    /// The result has been moved out through a handle.
    Consumed,
}

/// Heap allocation backing one task: the activation record of a suspended
/// computation.
///
/// `repr(C)` with `header` first, so `*mut TaskCell<F>` and `*mut Header`
/// are interchangeable thin pointers.
#[repr(C)]
pub(crate) struct TaskCell<F: Future> {
    header: Header,
    stage: RefCell<Stage<F>>,

    /// Waker of the frame awaiting this task through a handle. Waking it
    /// always resumes the awaiter's stack-bottom frame.
    join_waker: RefCell<Option<Waker>>,
}

impl<F: Future + 'static> TaskCell<F> {
    const VTABLE: Vtable = Vtable {
        poll: poll_raw::<F>,
        dealloc: dealloc_raw::<F>,
        try_read_output: try_read_output_raw::<F>,
    };

    /// Creates a frame in the initially-suspended state with a reference
    /// count of 1, held by the caller.
    pub(crate) fn allocate(future: F) -> RawTask {
        let cell = Box::new(TaskCell {
            header: Header::new(&Self::VTABLE),
            stage: RefCell::new(Stage::Pending(future)),
            join_waker: RefCell::new(None),
        });

        #[cfg(test)]
        crate::task::test_support::on_alloc();

        let ptr = NonNull::from(Box::leak(cell)).cast::<Header>();
        RawTask::from_ptr(ptr)
    }
}

unsafe fn poll_raw<F: Future>(ptr: NonNull<Header>) {
    let cell = unsafe { ptr.cast::<TaskCell<F>>().as_ref() };
    debug_assert_eq!(cell.header.state(), Lifecycle::Idle);

    cell.header.set_state(Lifecycle::Running);

    // The waker handed to the future points at this header: anything the
    // task suspends on (a child task, a completion record) wakes this frame,
    // the stack-bottom of its await chain.
    let waker = poll_waker(ptr);
    let mut cx = Context::from_waker(&waker);

    let polled = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut stage = cell.stage.borrow_mut();
        let Stage::Pending(future) = &mut *stage else {
            unreachable!("polling a finished task frame");
        };
        // Safety: the cell is heap-allocated and never moved after creation.
        let future = unsafe { Pin::new_unchecked(future) };
        future.poll(&mut cx)
    }));

    match polled {
        Ok(Poll::Pending) => cell.header.set_state(Lifecycle::Idle),
        Ok(Poll::Ready(output)) => complete(cell, Ok(output)),
        Err(payload) => complete(cell, Err(payload)),
    }
}

/// Final step of a task body: store the result, mark the frame done and hand
/// control to the awaiting frame by waking it. The wake puts the awaiter's
/// stack-bottom into the wake list, which the worker services before its
/// next kernel wait, so the caller resumes without a kernel round-trip.
fn complete<F: Future>(
    cell: &TaskCell<F>,
    result: Result<F::Output, Box<dyn Any + Send + 'static>>,
) {
    *cell.stage.borrow_mut() = Stage::Finished(result);
    cell.header.set_state(Lifecycle::Done);

    if let Some(waker) = cell.join_waker.borrow_mut().take() {
        waker.wake();
    }
}

unsafe fn dealloc_raw<F: Future>(ptr: NonNull<Header>) {
    let cell = unsafe { Box::from_raw(ptr.cast::<TaskCell<F>>().as_ptr()) };

    // A failure nobody awaited dies with the frame.
    if let Stage::Finished(Err(_)) = &*cell.stage.borrow() {
        tracing::warn!("task panicked and no handle observed the failure");
    }

    #[cfg(test)]
    crate::task::test_support::on_dealloc();

    drop(cell);
}

unsafe fn try_read_output_raw<F: Future>(ptr: NonNull<Header>, dst: *mut (), waker: &Waker) {
    let cell = unsafe { ptr.cast::<TaskCell<F>>().as_ref() };
    let dst = dst.cast::<Poll<F::Output>>();

    if cell.header.state() != Lifecycle::Done {
        // Replace, not append: only the most recent awaiter gets woken.
        *cell.join_waker.borrow_mut() = Some(waker.clone());
        return;
    }

    match cell.stage.replace(Stage::Consumed) {
        Stage::Finished(Ok(output)) => unsafe { dst.write(Poll::Ready(output)) },
        Stage::Finished(Err(payload)) => panic::resume_unwind(payload),
        Stage::Pending(_) => unreachable!("done frame still holds its future"),
        Stage::Consumed => panic!("task result already taken"),
    }
}
