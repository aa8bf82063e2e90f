//! The worker pool: a fixed set of completion-driven event loops started and
//! stopped as a unit.

use anyhow::{Context as _, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;

mod spawn;
pub use spawn::{schedule, spawn};

pub(crate) mod worker;
use worker::Worker;

#[cfg(test)]
mod tests;

/// A pool of workers, each bound to one kernel completion queue.
///
/// Construction initialises every queue eagerly; [`run`] starts one OS
/// thread per worker and blocks until [`stop`] takes effect. Top-level work
/// enters through [`dispatch`]; everything after that happens inside worker
/// tasks via [`spawn`]/[`schedule`] and the socket operations.
///
/// [`run`]: Runtime::run
/// [`stop`]: Runtime::stop
/// [`dispatch`]: Runtime::dispatch
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    workers: Box<[Worker]>,
    running: AtomicBool,

    #[cfg(windows)]
    _wsa: wsa::WsaGuard,
}

impl Runtime {
    /// Creates a pool with `count` workers; `count == 0` selects one worker
    /// per logical core (minimum one). Fails if any worker's completion
    /// queue cannot be initialised.
    pub fn new(count: usize) -> Result<Runtime> {
        #[cfg(windows)]
        let _wsa = wsa::WsaGuard::startup()?;

        let count = match count {
            0 => thread::available_parallelism().map_or(1, usize::from),
            n => n,
        };

        let workers = (0..count)
            .map(|i| Worker::new().with_context(|| format!("failed to initialise worker {i}")))
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();

        tracing::debug!(workers = count, "runtime created");

        Ok(Runtime {
            inner: Arc::new(Inner {
                workers,
                running: AtomicBool::new(false),
                #[cfg(windows)]
                _wsa,
            }),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// OS thread ids of the workers, in worker order; zero for any worker
    /// that is not currently running. Observability only: values appear as
    /// workers enter their loops and reset to zero as they leave.
    pub fn worker_thread_ids(&self) -> Vec<u64> {
        self.inner.workers.iter().map(Worker::thread_id).collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Relaxed)
    }

    /// Starts every worker on its own named thread and blocks the caller
    /// until all of them stop. Calling `run` on a running pool returns
    /// immediately.
    pub fn run(&self) {
        if self.inner.running.swap(true, Relaxed) {
            return;
        }

        thread::scope(|scope| {
            for (i, worker) in self.inner.workers.iter().enumerate() {
                thread::Builder::new()
                    .name(format!("tidepool-worker-{i}"))
                    .spawn_scoped(scope, move || worker.run())
                    .expect("failed to spawn worker thread");
            }
        });

        self.inner.running.store(false, Relaxed);
    }

    /// Requests every worker to stop. Non-blocking; each worker exits at
    /// the end of its current loop iteration, within the one-second wait
    /// bound.
    pub fn stop(&self) {
        for worker in &self.inner.workers {
            worker.request_stop();
        }
    }

    /// A clonable, thread-safe handle for requesting shutdown from inside a
    /// task (or from another thread).
    pub fn stopper(&self) -> Stopper {
        Stopper {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Seeds the pool: arranges for `factory` to be invoked once per worker
    /// and the resulting task scheduled there. This is the sole way to
    /// introduce top-level work from outside the pool.
    ///
    /// The factory itself crosses threads; each produced future is created
    /// on the worker that will own it and never migrates, so it does not
    /// need to be `Send` and may freely hold task handles across awaits.
    ///
    /// # Panics
    ///
    /// Panics if the pool is running; like the rest of the pre-run surface,
    /// `dispatch` is not concurrency-safe.
    pub fn dispatch<F, Fut>(&self, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        assert!(
            !self.is_running(),
            "dispatch is only allowed on a pool that is not running"
        );

        let factory = Arc::new(factory);
        for worker in &self.inner.workers {
            let factory = Arc::clone(&factory);
            worker.add_seed(Box::new(move || {
                let raw = crate::task::TaskCell::allocate(factory());
                // The creator reference detaches straight to the worker,
                // which releases it once the frame is done.
                worker::with_current(|w| w.schedule(raw));
            }));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug_assert!(
            !self.running.load(Relaxed),
            "runtime dropped while its workers are running"
        );
    }
}

/// Shutdown handle detached from the pool's lifetime, so that `'static`
/// tasks can request the stop the way the pool owner would.
#[derive(Clone)]
pub struct Stopper {
    inner: Arc<Inner>,
}

impl Stopper {
    /// See [`Runtime::stop`].
    pub fn stop(&self) {
        for worker in &self.inner.workers {
            worker.request_stop();
        }
    }
}

#[cfg(windows)]
mod wsa {
    use anyhow::{Context as _, Result};
    use std::io;
    use std::mem;
    use windows_sys::Win32::Networking::WinSock::{WSACleanup, WSAStartup, WSADATA};

    /// WinSock library lifetime, paired with the pool's.
    pub(super) struct WsaGuard;

    impl WsaGuard {
        pub(super) fn startup() -> Result<WsaGuard> {
            let mut data: WSADATA = unsafe { mem::zeroed() };
            // Version 2.2.
            let status = unsafe { WSAStartup(0x0202, &mut data) };
            if status != 0 {
                return Err(io::Error::from_raw_os_error(status))
                    .context("failed to start WinSock");
            }
            Ok(WsaGuard)
        }
    }

    impl Drop for WsaGuard {
        fn drop(&mut self) {
            unsafe { WSACleanup() };
        }
    }
}
