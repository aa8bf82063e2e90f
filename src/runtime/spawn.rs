use crate::runtime::worker;
use crate::task::{TaskCell, TaskHandle};
use std::future::Future;

/// Spawns a sibling task on the current worker and returns a handle to it.
///
/// The task starts suspended and runs in one of the worker's next loop
/// iterations. Awaiting the handle yields the task's output; a panic in the
/// task body is re-raised into the awaiter.
///
/// The future does not need to be `Send`: it is created on the worker that
/// will own it and never leaves that worker.
///
/// # Panics
///
/// Panics when called outside a worker task.
pub fn spawn<F>(future: F) -> TaskHandle<F::Output>
where
    F: Future + 'static,
{
    let raw = TaskCell::allocate(future);

    // Two references: the handle returned to the caller, and the detached
    // one the worker owns until it observes the frame done.
    let handle = unsafe { TaskHandle::from_raw(raw) };
    let detached = handle.clone().detach();

    worker::with_current(|w| w.schedule(detached));
    handle
}

/// Spawns a detached task on the current worker.
///
/// Like [`spawn`] without keeping a handle: the task's output (or captured
/// panic) is dropped when the frame is released.
///
/// # Panics
///
/// Panics when called outside a worker task.
pub fn schedule<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    // The creator reference detaches straight to the worker.
    let detached = unsafe { TaskHandle::<()>::from_raw(TaskCell::allocate(future)) }.detach();
    worker::with_current(|w| w.schedule(detached));
}
