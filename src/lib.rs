//! tidepool: a completion-driven async TCP runtime.
//!
//! A fixed pool of workers, each bound to one kernel completion queue
//! (io_uring on Linux, an I/O completion port on Windows), drives
//! non-atomically reference-counted task frames. Tasks suspend at I/O
//! points; the worker that owns them resumes each one when the kernel
//! reports the matching completion. Frames never migrate between workers.
//!
//! Top-level work enters through [`Runtime::dispatch`]; inside a worker,
//! tasks create siblings with [`spawn`]/[`schedule`] and perform socket I/O
//! through [`TcpServer`] and [`TcpStream`].

pub(crate) mod muxer;

pub mod net;
pub use net::{TcpServer, TcpStream};

pub mod runtime;
pub use runtime::{schedule, spawn, Runtime, Stopper};

pub mod task;
pub use task::TaskHandle;
