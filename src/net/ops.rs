//! Asynchronous socket operations.
//!
//! Every operation is a future wrapping an [`OpDriver`]: the first poll arms
//! the kernel request with the embedded completion record as its tag (or
//! finishes inline when the OS completes synchronously or refuses the
//! request), later polls translate the filled record into the operation's
//! typed result. The record, and any address buffers the kernel writes
//! into, are pinned fields of the future, which itself lives inside the
//! suspended task frame for the whole in-flight window.
//!
//! A request issued on a worker that is already stopping is refused up
//! front with the OS aborted-operation error: the queue will never be
//! pumped again, so arming would strand the awaiter.

use crate::muxer::Completion;
use crate::net::addr::{self, SocketAddrCRepr};
use crate::net::TcpStream;
use crate::runtime::worker;
use pin_project::pin_project;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

#[cfg(target_os = "linux")]
use io_uring::{opcode, types::Fd};
#[cfg(target_os = "linux")]
use std::mem::MaybeUninit;
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[cfg(windows)]
use crate::net::OwnedSocket;
#[cfg(windows)]
use windows_sys::Win32::Networking::WinSock::{
    WSAGetLastError, WSARecv, WSASend, LPFN_ACCEPTEX, LPFN_CONNECTEX, SOCKET, SOL_SOCKET,
    SO_UPDATE_ACCEPT_CONTEXT, SO_UPDATE_CONNECT_CONTEXT, WSABUF, WSAID_CONNECTEX, WSA_IO_PENDING,
};

/// The error reported for an operation issued on a stopping worker: the
/// platform's aborted-operation code, surfaced as a result, never an
/// unwind.
fn aborted_error() -> io::Error {
    #[cfg(target_os = "linux")]
    {
        io::Error::from_raw_os_error(libc::ECANCELED)
    }

    #[cfg(windows)]
    {
        io::Error::from_raw_os_error(windows_sys::Win32::Foundation::ERROR_OPERATION_ABORTED as i32)
    }
}

/// Refuses new kernel requests once the current worker is shutting down.
fn abort_if_stopping() -> io::Result<()> {
    if worker::current_is_stopping() {
        return Err(aborted_error());
    }
    Ok(())
}

/// Outcome of arming one kernel request.
pub(crate) enum Submit<T> {
    /// The request is in flight; the worker will fill the record and wake
    /// the frame.
    Pending,
    /// The operation finished inline (synchronous completion, or a failure
    /// to issue). Nothing was left for the worker to complete.
    Finished(T),
}

/// One socket operation's interaction with the kernel queue.
pub trait OpDriver {
    type Output;

    /// Issues the request tagged with `completion`.
    fn submit(self: Pin<&mut Self>, completion: &Completion) -> Submit<Self::Output>;

    /// Translates the filled record into the operation's result.
    fn complete(self: Pin<&mut Self>, completion: &Completion) -> Self::Output;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    Initial,
    Submitted,
    Completed,
}

/// A single-shot socket operation future. See the module docs for the poll
/// protocol.
#[pin_project]
pub struct Op<D> {
    #[pin]
    driver: D,

    #[pin]
    completion: Completion,

    state: OpState,
}

impl<D: OpDriver> Op<D> {
    pub(crate) fn new(driver: D) -> Op<D> {
        Op {
            driver,
            completion: Completion::new(),
            state: OpState::Initial,
        }
    }
}

impl<D: OpDriver> Future for Op<D> {
    type Output = D::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        match *this.state {
            OpState::Initial => {
                let completion = this.completion.as_ref().get_ref();
                completion.arm(cx.waker());

                match this.driver.as_mut().submit(completion) {
                    Submit::Pending => {
                        *this.state = OpState::Submitted;
                        Poll::Pending
                    }
                    Submit::Finished(output) => {
                        // Synchronous path: the task keeps running, nothing
                        // enters the wake list.
                        completion.disarm();
                        *this.state = OpState::Completed;
                        Poll::Ready(output)
                    }
                }
            }
            OpState::Submitted => {
                let completion = this.completion.as_ref().get_ref();
                if !completion.is_ready() {
                    completion.update_waker(cx.waker());
                    return Poll::Pending;
                }

                *this.state = OpState::Completed;
                Poll::Ready(this.driver.as_mut().complete(completion))
            }
            OpState::Completed => panic!("operation future polled after completion"),
        }
    }
}

///
/// === Accept ===
///
#[cfg(target_os = "linux")]
#[pin_project]
pub struct AcceptOp<'a> {
    listener: RawFd,

    // Written by the kernel while the operation is in flight; must not move.
    #[pin]
    addr: MaybeUninit<libc::sockaddr_storage>,

    #[pin]
    addrlen: libc::socklen_t,

    _server: std::marker::PhantomData<&'a ()>,
}

#[cfg(target_os = "linux")]
impl<'a> AcceptOp<'a> {
    pub(crate) fn new(listener: &'a OwnedFd) -> AcceptOp<'a> {
        AcceptOp {
            listener: listener.as_raw_fd(),
            addr: MaybeUninit::uninit(),
            addrlen: size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            _server: std::marker::PhantomData,
        }
    }
}

#[cfg(target_os = "linux")]
impl OpDriver for AcceptOp<'_> {
    type Output = io::Result<TcpStream>;

    fn submit(self: Pin<&mut Self>, completion: &Completion) -> Submit<Self::Output> {
        if let Err(e) = abort_if_stopping() {
            return Submit::Finished(Err(e));
        }

        let this = self.project();

        let entry = opcode::Accept::new(
            Fd(*this.listener),
            this.addr.get_mut().as_mut_ptr().cast(),
            std::ptr::from_mut(this.addrlen.get_mut()),
        )
        .flags(libc::SOCK_CLOEXEC)
        .build()
        .user_data(completion.user_data());

        match worker::with_muxer(|muxer| muxer.push(&entry)) {
            Ok(()) => Submit::Pending,
            Err(e) => Submit::Finished(Err(e)),
        }
    }

    fn complete(self: Pin<&mut Self>, completion: &Completion) -> Self::Output {
        let this = self.project();

        let res = completion.os_result();
        if res < 0 {
            return Err(io::Error::from_raw_os_error(-res));
        }

        // Safety: a non-negative accept result is a freshly created fd that
        // nothing else owns yet.
        let socket = unsafe { OwnedFd::from_raw_fd(res) };

        // Safety: the kernel wrote the peer address into the pinned buffer.
        let peer = unsafe { addr::socket_addr_from_c(this.addr.as_ptr(), *this.addrlen as usize) }?;

        Ok(TcpStream::from_parts(socket, peer))
    }
}

#[cfg(windows)]
const ACCEPT_ADDR_LEN: usize =
    size_of::<windows_sys::Win32::Networking::WinSock::SOCKADDR_STORAGE>() + 16;

#[cfg(windows)]
#[pin_project]
pub struct AcceptOp<'a> {
    listener: SOCKET,
    accept_ex: LPFN_ACCEPTEX,
    accepted: Option<OwnedSocket>,

    // AcceptEx writes the remote address here while in flight.
    #[pin]
    addr_buf: [u8; ACCEPT_ADDR_LEN],

    _server: std::marker::PhantomData<&'a ()>,
}

#[cfg(windows)]
impl<'a> AcceptOp<'a> {
    pub(crate) fn new(listener: &'a OwnedSocket, accept_ex: LPFN_ACCEPTEX) -> AcceptOp<'a> {
        AcceptOp {
            listener: listener.raw(),
            accept_ex,
            accepted: None,
            addr_buf: [0; ACCEPT_ADDR_LEN],
            _server: std::marker::PhantomData,
        }
    }

    fn finish(accepted: OwnedSocket, listener: SOCKET) -> io::Result<TcpStream> {
        // The accepted socket inherits listener properties only after this.
        let listener_val = listener;
        let rc = unsafe {
            windows_sys::Win32::Networking::WinSock::setsockopt(
                accepted.raw(),
                SOL_SOCKET as i32,
                SO_UPDATE_ACCEPT_CONTEXT as i32,
                std::ptr::from_ref(&listener_val).cast(),
                size_of::<SOCKET>() as i32,
            )
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() }));
        }

        let peer = crate::net::tcp::peer_addr_of(accepted.raw())?;
        Ok(TcpStream::from_parts(accepted, peer))
    }
}

#[cfg(windows)]
impl OpDriver for AcceptOp<'_> {
    type Output = io::Result<TcpStream>;

    fn submit(self: Pin<&mut Self>, completion: &Completion) -> Submit<Self::Output> {
        if let Err(e) = abort_if_stopping() {
            return Submit::Finished(Err(e));
        }

        let this = self.project();

        let local = match crate::net::tcp::local_addr_of(*this.listener) {
            Ok(addr) => addr,
            Err(e) => return Submit::Finished(Err(e)),
        };

        let accepted = match crate::net::tcp::new_overlapped_socket(&local) {
            Ok(socket) => socket,
            Err(e) => return Submit::Finished(Err(e)),
        };

        // Register the connection socket before the first operation on it.
        if let Err(e) = worker::with_muxer(|muxer| muxer.register(accepted.raw())) {
            return Submit::Finished(Err(e));
        }

        let Some(accept_ex) = *this.accept_ex else {
            return Submit::Finished(Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "AcceptEx unavailable",
            )));
        };

        let mut bytes: u32 = 0;
        let ok = unsafe {
            accept_ex(
                *this.listener,
                accepted.raw(),
                this.addr_buf.get_mut().as_mut_ptr().cast(),
                0,
                0,
                ACCEPT_ADDR_LEN as u32,
                &mut bytes,
                completion.overlapped_ptr(),
            )
        };

        if ok != 0 {
            // Synchronous completion: skip-on-success suppressed the packet.
            return Submit::Finished(Self::finish(accepted, *this.listener));
        }

        let error = unsafe { WSAGetLastError() };
        if error == WSA_IO_PENDING {
            *this.accepted = Some(accepted);
            Submit::Pending
        } else {
            // `accepted` drops here, closing the half-open socket.
            Submit::Finished(Err(io::Error::from_raw_os_error(error)))
        }
    }

    fn complete(self: Pin<&mut Self>, completion: &Completion) -> Self::Output {
        let this = self.project();
        let accepted = this.accepted.take().expect("accept completed twice");

        completion.io_result()?;
        Self::finish(accepted, *this.listener)
    }
}

///
/// === Connect ===
///
#[pin_project]
pub struct ConnectOp {
    addr: SocketAddr,

    #[pin]
    raw_addr: SocketAddrCRepr,
    raw_len: i32,

    #[cfg(target_os = "linux")]
    socket: Option<OwnedFd>,

    #[cfg(windows)]
    socket: Option<OwnedSocket>,
}

impl ConnectOp {
    pub(crate) fn new(addr: SocketAddr) -> ConnectOp {
        let (raw_addr, raw_len) = addr::socket_addr_to_c(&addr);
        ConnectOp {
            addr,
            raw_addr,
            raw_len: raw_len as i32,
            socket: None,
        }
    }
}

#[cfg(target_os = "linux")]
impl OpDriver for ConnectOp {
    type Output = io::Result<TcpStream>;

    fn submit(self: Pin<&mut Self>, completion: &Completion) -> Submit<Self::Output> {
        if let Err(e) = abort_if_stopping() {
            return Submit::Finished(Err(e));
        }

        let this = self.project();

        let socket = match crate::net::tcp::new_tcp_socket(this.addr) {
            Ok(socket) => socket,
            Err(e) => return Submit::Finished(Err(e)),
        };

        let entry = opcode::Connect::new(
            Fd(socket.as_raw_fd()),
            this.raw_addr.as_ptr(),
            *this.raw_len as libc::socklen_t,
        )
        .build()
        .user_data(completion.user_data());

        match worker::with_muxer(|muxer| muxer.push(&entry)) {
            Ok(()) => {
                *this.socket = Some(socket);
                Submit::Pending
            }
            // `socket` drops here, closing the half-open socket.
            Err(e) => Submit::Finished(Err(e)),
        }
    }

    fn complete(self: Pin<&mut Self>, completion: &Completion) -> Self::Output {
        let this = self.project();
        let socket = this.socket.take().expect("connect completed twice");

        let res = completion.os_result();
        if res < 0 {
            return Err(io::Error::from_raw_os_error(-res));
        }

        Ok(TcpStream::from_parts(socket, *this.addr))
    }
}

#[cfg(windows)]
impl OpDriver for ConnectOp {
    type Output = io::Result<TcpStream>;

    fn submit(self: Pin<&mut Self>, completion: &Completion) -> Submit<Self::Output> {
        if let Err(e) = abort_if_stopping() {
            return Submit::Finished(Err(e));
        }

        let this = self.project();

        let socket = match crate::net::tcp::new_overlapped_socket(this.addr) {
            Ok(socket) => socket,
            Err(e) => return Submit::Finished(Err(e)),
        };

        // ConnectEx requires a bound socket.
        if let Err(e) = crate::net::tcp::bind_any(socket.raw(), this.addr) {
            return Submit::Finished(Err(e));
        }

        if let Err(e) = worker::with_muxer(|muxer| muxer.register(socket.raw())) {
            return Submit::Finished(Err(e));
        }

        let connect_ex: LPFN_CONNECTEX = match wsa_extension(socket.raw(), &WSAID_CONNECTEX) {
            Ok(ptr) => unsafe { std::mem::transmute(ptr) },
            Err(e) => return Submit::Finished(Err(e)),
        };
        let Some(connect_ex) = connect_ex else {
            return Submit::Finished(Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ConnectEx unavailable",
            )));
        };

        let mut bytes: u32 = 0;
        let ok = unsafe {
            connect_ex(
                socket.raw(),
                this.raw_addr.as_ptr(),
                *this.raw_len,
                std::ptr::null(),
                0,
                &mut bytes,
                completion.overlapped_ptr(),
            )
        };

        if ok != 0 {
            return Submit::Finished(finish_connect(socket, *this.addr));
        }

        let error = unsafe { WSAGetLastError() };
        if error == WSA_IO_PENDING {
            *this.socket = Some(socket);
            Submit::Pending
        } else {
            Submit::Finished(Err(io::Error::from_raw_os_error(error)))
        }
    }

    fn complete(self: Pin<&mut Self>, completion: &Completion) -> Self::Output {
        let this = self.project();
        let socket = this.socket.take().expect("connect completed twice");

        completion.io_result()?;
        finish_connect(socket, *this.addr)
    }
}

#[cfg(windows)]
fn finish_connect(socket: OwnedSocket, addr: SocketAddr) -> io::Result<TcpStream> {
    let rc = unsafe {
        windows_sys::Win32::Networking::WinSock::setsockopt(
            socket.raw(),
            SOL_SOCKET as i32,
            SO_UPDATE_CONNECT_CONTEXT as i32,
            std::ptr::null(),
            0,
        )
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() }));
    }
    Ok(TcpStream::from_parts(socket, addr))
}

///
/// === Send ===
///
#[pin_project]
pub struct SendOp<'a> {
    #[cfg(target_os = "linux")]
    socket: RawFd,
    #[cfg(windows)]
    socket: SOCKET,

    buf: &'a [u8],
}

impl<'a> SendOp<'a> {
    #[cfg(target_os = "linux")]
    pub(crate) fn new(socket: RawFd, buf: &'a [u8]) -> SendOp<'a> {
        SendOp { socket, buf }
    }

    #[cfg(windows)]
    pub(crate) fn new(socket: SOCKET, buf: &'a [u8]) -> SendOp<'a> {
        SendOp { socket, buf }
    }
}

#[cfg(target_os = "linux")]
impl OpDriver for SendOp<'_> {
    type Output = io::Result<u32>;

    fn submit(self: Pin<&mut Self>, completion: &Completion) -> Submit<Self::Output> {
        if let Err(e) = abort_if_stopping() {
            return Submit::Finished(Err(e));
        }

        let this = self.project();

        let entry = opcode::Send::new(Fd(*this.socket), this.buf.as_ptr(), this.buf.len() as u32)
            .flags(libc::MSG_NOSIGNAL)
            .build()
            .user_data(completion.user_data());

        match worker::with_muxer(|muxer| muxer.push(&entry)) {
            Ok(()) => Submit::Pending,
            Err(e) => Submit::Finished(Err(e)),
        }
    }

    fn complete(self: Pin<&mut Self>, completion: &Completion) -> Self::Output {
        completion.io_result()
    }
}

#[cfg(windows)]
impl OpDriver for SendOp<'_> {
    type Output = io::Result<u32>;

    fn submit(self: Pin<&mut Self>, completion: &Completion) -> Submit<Self::Output> {
        if let Err(e) = abort_if_stopping() {
            return Submit::Finished(Err(e));
        }

        let this = self.project();

        let buffer = WSABUF {
            len: this.buf.len() as u32,
            buf: this.buf.as_ptr() as *mut u8,
        };
        let mut bytes: u32 = 0;

        let rc = unsafe {
            WSASend(
                *this.socket,
                &buffer,
                1,
                &mut bytes,
                0,
                completion.overlapped_ptr(),
                None,
            )
        };

        if rc == 0 {
            // Synchronous completion: skip-on-success suppressed the packet.
            return Submit::Finished(Ok(bytes));
        }

        let error = unsafe { WSAGetLastError() };
        if error == WSA_IO_PENDING {
            Submit::Pending
        } else {
            Submit::Finished(Err(io::Error::from_raw_os_error(error)))
        }
    }

    fn complete(self: Pin<&mut Self>, completion: &Completion) -> Self::Output {
        completion.io_result()
    }
}

///
/// === Receive ===
///
#[pin_project]
pub struct RecvOp<'a> {
    #[cfg(target_os = "linux")]
    socket: RawFd,
    #[cfg(windows)]
    socket: SOCKET,

    buf: &'a mut [u8],
}

impl<'a> RecvOp<'a> {
    #[cfg(target_os = "linux")]
    pub(crate) fn new(socket: RawFd, buf: &'a mut [u8]) -> RecvOp<'a> {
        RecvOp { socket, buf }
    }

    #[cfg(windows)]
    pub(crate) fn new(socket: SOCKET, buf: &'a mut [u8]) -> RecvOp<'a> {
        RecvOp { socket, buf }
    }
}

#[cfg(target_os = "linux")]
impl OpDriver for RecvOp<'_> {
    type Output = io::Result<u32>;

    fn submit(self: Pin<&mut Self>, completion: &Completion) -> Submit<Self::Output> {
        if let Err(e) = abort_if_stopping() {
            return Submit::Finished(Err(e));
        }

        let this = self.project();

        let entry = opcode::Recv::new(
            Fd(*this.socket),
            this.buf.as_mut_ptr(),
            this.buf.len() as u32,
        )
        .build()
        .user_data(completion.user_data());

        match worker::with_muxer(|muxer| muxer.push(&entry)) {
            Ok(()) => Submit::Pending,
            Err(e) => Submit::Finished(Err(e)),
        }
    }

    fn complete(self: Pin<&mut Self>, completion: &Completion) -> Self::Output {
        completion.io_result()
    }
}

#[cfg(windows)]
impl OpDriver for RecvOp<'_> {
    type Output = io::Result<u32>;

    fn submit(self: Pin<&mut Self>, completion: &Completion) -> Submit<Self::Output> {
        if let Err(e) = abort_if_stopping() {
            return Submit::Finished(Err(e));
        }

        let this = self.project();

        let buffer = WSABUF {
            len: this.buf.len() as u32,
            buf: this.buf.as_mut_ptr(),
        };
        let mut bytes: u32 = 0;
        let mut flags: u32 = 0;

        let rc = unsafe {
            WSARecv(
                *this.socket,
                &buffer,
                1,
                &mut bytes,
                &mut flags,
                completion.overlapped_ptr(),
                None,
            )
        };

        if rc == 0 {
            return Submit::Finished(Ok(bytes));
        }

        let error = unsafe { WSAGetLastError() };
        if error == WSA_IO_PENDING {
            Submit::Pending
        } else {
            Submit::Finished(Err(io::Error::from_raw_os_error(error)))
        }
    }

    fn complete(self: Pin<&mut Self>, completion: &Completion) -> Self::Output {
        completion.io_result()
    }
}

/// Resolves a WinSock extension function on `socket`.
#[cfg(windows)]
pub(crate) fn wsa_extension(
    socket: SOCKET,
    guid: &windows_sys::core::GUID,
) -> io::Result<*const std::ffi::c_void> {
    use windows_sys::Win32::Networking::WinSock::{WSAIoctl, SIO_GET_EXTENSION_FUNCTION_POINTER};

    let mut func: *const std::ffi::c_void = std::ptr::null();
    let mut bytes: u32 = 0;

    let rc = unsafe {
        WSAIoctl(
            socket,
            SIO_GET_EXTENSION_FUNCTION_POINTER,
            std::ptr::from_ref(guid).cast(),
            size_of::<windows_sys::core::GUID>() as u32,
            std::ptr::from_mut(&mut func).cast(),
            size_of::<*const std::ffi::c_void>() as u32,
            &mut bytes,
            std::ptr::null_mut(),
            None,
        )
    };

    if rc != 0 {
        return Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() }));
    }
    Ok(func)
}
