use crate::muxer::Muxer;
use crate::task::{Lifecycle, RawTask};
use anyhow::Result;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::time::Duration;

/// Upper bound on one blocking wait for completions. The stop flag is polled
/// once per iteration, so this is also the worst-case shutdown latency.
const WAIT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(1);

thread_local! {
    /// The worker driving the current thread, set for the duration of
    /// [`Worker::run`]. Read by `spawn`/`schedule` and by op-futures arming
    /// kernel requests.
    static CURRENT: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// Runs `f` with the worker owning the current thread.
///
/// Panics when the current thread is not inside [`Worker::run`]: async
/// operations and task scheduling only make sense on a worker.
pub(crate) fn with_current<R>(f: impl FnOnce(&Worker) -> R) -> R {
    let ptr = CURRENT.get();
    assert!(
        !ptr.is_null(),
        "not running inside a tidepool worker; \
         use Runtime::dispatch to enter the runtime"
    );
    // Safety: the pointer is set by the worker running on this very thread
    // and cleared before `run` returns.
    f(unsafe { &*ptr })
}

/// Appends a woken frame to the current worker's wake list. Called from task
/// wakers, which only ever fire on the thread that owns the frame.
pub(crate) fn push_woken(raw: RawTask) {
    with_current(|worker| worker.wake_list.borrow_mut().push_back(raw));
}

/// Runs `f` with the current worker's muxer. Used by op-futures to enqueue
/// kernel requests on the queue their frame belongs to.
pub(crate) fn with_muxer<R>(f: impl FnOnce(&mut Muxer) -> R) -> R {
    with_current(|worker| f(&mut worker.muxer.borrow_mut()))
}

/// Whether the current worker has been asked to stop. Op-futures consult
/// this before arming a request: a stopping worker never pumps its queue
/// again, so a request armed now would strand its awaiter.
pub(crate) fn current_is_stopping() -> bool {
    with_current(Worker::is_stopping)
}

/// One event-loop thread paired with one kernel completion queue and one
/// wake list.
///
/// Everything except the three flag words is single-owner state: only the
/// thread inside [`Worker::run`] touches the muxer or the wake list, with
/// the one sequenced exception of `schedule` calls made by the runtime
/// before that thread exists.
pub(crate) struct Worker {
    muxer: RefCell<Muxer>,

    /// Frames ready to resume, FIFO in completion order.
    wake_list: RefCell<VecDeque<RawTask>>,

    /// Task factories deposited by `dispatch` before the worker starts,
    /// invoked on the worker thread at loop entry so the produced futures
    /// never cross threads.
    seeds: RefCell<Vec<Box<dyn FnOnce() + Send>>>,

    is_running: AtomicBool,
    should_stop: AtomicBool,

    /// OS thread id while running, zero otherwise.
    thread_id: AtomicU64,
}

// Safety: shared across threads only for the relaxed atomic flags and for
// pre-run `schedule`. The interior-mutable state is confined to the single
// thread executing `run`; frames and completions never migrate off it.
unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    /// Creates the worker and its kernel queue eagerly; a queue that cannot
    /// be created fails pool construction.
    pub(crate) fn new() -> Result<Worker> {
        Ok(Worker {
            muxer: RefCell::new(Muxer::new()?),
            wake_list: RefCell::new(VecDeque::with_capacity(64)),
            seeds: RefCell::new(Vec::new()),
            is_running: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            thread_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Relaxed)
    }

    /// Requests the event loop to exit. Non-blocking; takes effect within
    /// one loop iteration.
    pub(crate) fn request_stop(&self) {
        self.should_stop.store(true, Relaxed);
        tracing::debug!(thread_id = self.thread_id(), "worker stop requested");
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.should_stop.load(Relaxed)
    }

    /// OS thread id of the worker while it is running, zero otherwise.
    pub(crate) fn thread_id(&self) -> u64 {
        self.thread_id.load(Relaxed)
    }

    /// Deposits a top-level task factory to be run at loop entry. Only
    /// valid before the worker starts; not concurrency-safe.
    pub(crate) fn add_seed(&self, seed: Box<dyn FnOnce() + Send>) {
        debug_assert!(!self.is_running());
        self.seeds.borrow_mut().push(seed);
    }

    /// Hands a detached frame to this worker, which owns it from here on.
    ///
    /// Not concurrency-safe: callable from the worker's own thread (a task
    /// spawning a sibling) or from the runtime before the worker starts. In
    /// the running case a no-op completion is posted so a worker blocked in
    /// the kernel wait picks the frame up promptly; before `run` no no-op is
    /// posted and the frame is drained by the first loop iteration.
    pub(crate) fn schedule(&self, raw: RawTask) {
        raw.header().set_queued(true);
        self.wake_list.borrow_mut().push_back(raw);

        if self.is_running() {
            if let Err(e) = self.muxer.borrow_mut().post_wakeup() {
                tracing::warn!(error = %e, "failed to post wakeup no-op");
            }
        }
    }

    /// The event loop. Blocks the calling thread until [`request_stop`].
    /// Calling it again while running is a no-op.
    ///
    /// [`request_stop`]: Worker::request_stop
    pub(crate) fn run(&self) {
        if self.is_running.swap(true, Relaxed) {
            return;
        }

        self.should_stop.store(false, Relaxed);
        self.thread_id.store(os_thread_id(), Relaxed);
        CURRENT.set(self as *const Worker);

        // Under SINGLE_ISSUER the queue must be enabled by the thread that
        // will submit to it, which is this one.
        self.muxer
            .borrow_mut()
            .activate()
            .expect("failed to activate completion queue");

        tracing::debug!(thread_id = self.thread_id(), "worker running");

        // Top-level tasks are created here, on the thread that owns them.
        for seed in self.seeds.borrow_mut().drain(..) {
            seed();
        }

        let mut batch: VecDeque<RawTask> = VecDeque::with_capacity(64);

        while !self.should_stop.load(Relaxed) {
            // Block on the kernel only when there is nothing to resume;
            // frames woken by other tasks must not wait out the timeout.
            let timeout = if self.wake_list.borrow().is_empty() {
                WAIT_COMPLETION_TIMEOUT
            } else {
                Duration::ZERO
            };

            // Submit queued requests, wait, then drain. Draining fills each
            // completion record and wakes its frame into the wake list.
            if let Err(e) = self.muxer.borrow_mut().pump(timeout) {
                tracing::error!(error = %e, "completion queue pump failed");
            }

            // Swap the list out so resumed tasks enqueue for the next
            // iteration instead of extending this one.
            mem::swap(&mut *self.wake_list.borrow_mut(), &mut batch);

            for raw in batch.drain(..) {
                debug_assert_eq!(raw.header().state(), Lifecycle::Idle);
                raw.header().set_queued(false);

                // Resuming always means polling the stack-bottom frame;
                // interior awaits live inside its state machine.
                raw.poll();

                if raw.header().state() == Lifecycle::Done {
                    // Drop the reference detached to this worker at
                    // schedule time. Frames nobody holds a handle to are
                    // freed here.
                    raw.drop_reference();
                }
            }
        }

        tracing::debug!(thread_id = self.thread_id(), "worker stopped");

        self.thread_id.store(0, Relaxed);
        CURRENT.set(ptr::null());
        self.is_running.store(false, Relaxed);
    }

    /// Number of frames currently waiting to be resumed. Instrumentation
    /// for tests asserting that synchronous completions skip the wake list.
    #[cfg(test)]
    #[allow(dead_code)]
    pub(crate) fn wake_list_len(&self) -> usize {
        self.wake_list.borrow().len()
    }
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> u64 {
    nix::unistd::gettid().as_raw() as u64
}

#[cfg(windows)]
fn os_thread_id() -> u64 {
    unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() as u64 }
}

/// Wake-list length of the current worker; see [`Worker::wake_list_len`].
#[cfg(test)]
#[allow(dead_code)]
pub(crate) fn current_wake_list_len() -> usize {
    with_current(Worker::wake_list_len)
}
