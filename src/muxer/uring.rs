use crate::muxer::Completion;
use anyhow::{Context as _, Result};
use io_uring::squeue::Entry;
use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{opcode, IoUring};
use std::io;
use std::time::Duration;

/// Submission/completion queue depth requested at init. `IORING_SETUP_CLAMP`
/// is always set, so older kernels silently shrink this to their maximum.
const QUEUE_DEPTH: u32 = 32768;

/// One worker's io_uring instance.
///
/// The ring is created eagerly by the runtime constructor (on the runtime's
/// thread) but, where the kernel supports it, in the disabled state: the
/// worker enables it from its own thread at loop entry, so that under
/// `IORING_SETUP_SINGLE_ISSUER` the registered issuer is the worker thread
/// and not whichever thread built the pool.
pub(crate) struct Muxer {
    ring: IoUring,

    /// Built with `IORING_SETUP_R_DISABLED`; `activate` must enable it.
    deferred: bool,
}

impl Muxer {
    pub(crate) fn new() -> Result<Muxer> {
        let version = kernel_version();

        let mut builder = IoUring::builder();
        builder.setup_clamp();

        if version >= (5, 18) {
            builder.setup_submit_all();
        }
        if version >= (5, 19) {
            builder.setup_coop_taskrun();
            builder.setup_taskrun_flag();
        }

        let deferred = version >= (5, 10);
        if deferred {
            builder.setup_r_disabled();
        }
        if version >= (6, 0) {
            builder.setup_single_issuer();
        }

        let ring = builder
            .build(QUEUE_DEPTH)
            .context("failed to create io_uring instance")?;

        let params = ring.params();
        tracing::debug!(
            kernel = ?version,
            single_mmap = params.is_feature_single_mmap(),
            nodrop = params.is_feature_nodrop(),
            rw_cur_pos = params.is_feature_rw_cur_pos(),
            fast_poll = params.is_feature_fast_poll(),
            sq_entries = params.sq_entries(),
            cq_entries = params.cq_entries(),
            "io_uring initialised"
        );

        if !params.is_feature_nodrop() {
            tracing::warn!(
                "IORING_FEAT_NODROP unavailable: the kernel may drop completions under CQ overflow"
            );
        }

        Ok(Muxer { ring, deferred })
    }

    /// Called once from the worker thread before the first `pump`.
    pub(crate) fn activate(&mut self) -> io::Result<()> {
        if self.deferred {
            self.deferred = false;
            self.ring.submitter().register_enable_rings()?;
        }
        Ok(())
    }

    /// Queues one SQE. If the submission ring is full, submits what is
    /// pending to make room and retries.
    pub(crate) fn push(&mut self, entry: &Entry) -> io::Result<()> {
        loop {
            // Safety: the entry's referenced buffers are owned by a pinned
            // completion record / op-future that outlives the operation.
            if unsafe { self.ring.submission().push(entry) }.is_ok() {
                return Ok(());
            }
            self.ring.submit()?;
        }
    }

    /// Posts a null-tagged no-op and submits immediately, forcing a blocked
    /// `pump` on this queue to return. The drain pass skips the completion
    /// because its tag is null.
    pub(crate) fn post_wakeup(&mut self) -> io::Result<()> {
        let nop = opcode::Nop::new().build().user_data(0);
        self.push(&nop)?;
        self.ring.submit()?;
        Ok(())
    }

    /// One pass of the completion side: submit anything the tasks queued
    /// since the last pass, wait up to `timeout` for at least one
    /// completion, then drain every completion that is already available.
    ///
    /// Each drained completion's record is filled before its task is woken,
    /// so a task resumed afterwards always observes its own result.
    pub(crate) fn pump(&mut self, timeout: Duration) -> io::Result<usize> {
        let ts = Timespec::from(timeout);
        let args = SubmitArgs::new().timespec(&ts);

        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            // Timed out, interrupted, or racing completion reaping: all mean
            // "nothing to wait for right now", not failure.
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
                ) => {}
            Err(e) => return Err(e),
        }

        let mut drained = 0;
        for cqe in self.ring.completion() {
            let tag = cqe.user_data();
            if tag == 0 {
                // Wakeup no-op from `post_wakeup`: no record attached.
                continue;
            }

            // Safety: a non-null tag is the address of a pinned Completion
            // owned by a suspended op-future; the frame holding it cannot be
            // freed while the operation is in flight.
            let record = unsafe { &*(tag as usize as *const Completion) };
            record.fill(cqe.result(), cqe.flags());
            drained += 1;
        }

        if drained > 0 {
            tracing::trace!(drained, "completions drained");
        }
        Ok(drained)
    }
}

/// (major, minor) of the running kernel, `(0, 0)` when undeterminable.
fn kernel_version() -> (u32, u32) {
    let Ok(uts) = nix::sys::utsname::uname() else {
        return (0, 0);
    };

    let release = uts.release().to_string_lossy();
    let mut parts = release.split(['.', '-']);

    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_version_is_plausible() {
        let (major, minor) = kernel_version();
        assert!(major >= 2, "running kernel reported {major}.{minor}");
    }

    #[test]
    fn muxer_initialises_eagerly() -> Result<()> {
        let mut muxer = Muxer::new()?;
        muxer.activate()?;

        // A wakeup no-op round-trips through the queue with a null tag and
        // wakes nothing.
        muxer.post_wakeup()?;
        let drained = muxer.pump(Duration::from_secs(1))?;
        assert_eq!(drained, 0);
        Ok(())
    }
}
