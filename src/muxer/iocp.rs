use crate::muxer::Completion;
use anyhow::{Context as _, Result};
use std::io;
use std::ptr;
use std::time::Duration;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    SetFileCompletionNotificationModes, FILE_SKIP_COMPLETION_PORT_ON_SUCCESS,
    FILE_SKIP_SET_EVENT_ON_HANDLE,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
};

/// One worker's I/O completion port.
pub(crate) struct Muxer {
    port: HANDLE,
}

impl Muxer {
    pub(crate) fn new() -> Result<Muxer> {
        // Concurrency value 1: exactly one thread services this port.
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(io::Error::last_os_error()).context("failed to create IOCP");
        }
        Ok(Muxer { port })
    }

    /// Parity with the Linux backend's deferred-enable step; IOCP ports are
    /// usable from any thread as soon as they exist.
    pub(crate) fn activate(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Associates a socket with this port and turns off completion-port
    /// notifications for synchronously finished operations, so the inline
    /// fast path never produces a queued completion.
    pub(crate) fn register(&self, socket: usize) -> io::Result<()> {
        let handle = socket as HANDLE;

        if unsafe { CreateIoCompletionPort(handle, self.port, 0, 0) }.is_null() {
            return Err(io::Error::last_os_error());
        }

        let modes = (FILE_SKIP_COMPLETION_PORT_ON_SUCCESS | FILE_SKIP_SET_EVENT_ON_HANDLE) as u8;
        if unsafe { SetFileCompletionNotificationModes(handle, modes) } == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Posts a null-tagged completion, forcing a blocked `pump` to return.
    pub(crate) fn post_wakeup(&mut self) -> io::Result<()> {
        if unsafe { PostQueuedCompletionStatus(self.port, 0, 0, ptr::null_mut()) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// One pass of the completion side: wait up to `timeout` for at least
    /// one packet, then drain everything already queued without blocking.
    pub(crate) fn pump(&mut self, timeout: Duration) -> io::Result<usize> {
        let mut wait_ms = timeout.as_millis() as u32;
        let mut drained = 0;

        loop {
            let mut bytes: u32 = 0;
            let mut key: usize = 0;
            let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

            let ok = unsafe {
                GetQueuedCompletionStatus(self.port, &mut bytes, &mut key, &mut overlapped, wait_ms)
            };
            // Only the first wait may block; the rest of the pass peeks.
            wait_ms = 0;

            let error = if ok == 0 {
                let error = unsafe { GetLastError() };
                if overlapped.is_null() {
                    // No packet: the bounded wait elapsed.
                    debug_assert!(drained > 0 || error == WAIT_TIMEOUT);
                    break;
                }
                error
            } else {
                0
            };

            if overlapped.is_null() {
                // Wakeup packet from `post_wakeup`: no record attached.
                continue;
            }

            // Safety: a non-null OVERLAPPED is the first field of a pinned
            // Completion owned by a suspended op-future; the frame holding
            // it cannot be freed while the operation is in flight.
            let record = unsafe { &*(overlapped as *const Completion) };
            record.fill(error, bytes);
            drained += 1;
        }

        if drained > 0 {
            tracing::trace!(drained, "completions drained");
        }
        Ok(drained)
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port) };
    }
}
