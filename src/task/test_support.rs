//! Frame accounting for tests: every allocation and deallocation of a task
//! cell bumps a process-wide counter, letting scenario tests assert that no
//! frame outlives its pool. Counters are atomic only because `cargo test`
//! deallocates frames on worker threads; production frames never share a
//! count across threads.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Mutex, MutexGuard};

static ALLOCATED: AtomicU64 = AtomicU64::new(0);
static RELEASED: AtomicU64 = AtomicU64::new(0);

pub(crate) fn on_alloc() {
    ALLOCATED.fetch_add(1, Relaxed);
}

pub(crate) fn on_dealloc() {
    RELEASED.fetch_add(1, Relaxed);
}

/// (allocated, released) totals.
pub(crate) fn frame_counts() -> (u64, u64) {
    (ALLOCATED.load(Relaxed), RELEASED.load(Relaxed))
}

static SERIAL: Mutex<()> = Mutex::new(());

/// Serializes tests that allocate frames, so frame-count deltas observed by
/// one test are not polluted by another running in parallel.
pub(crate) fn serial_guard() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
