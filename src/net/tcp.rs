//! TCP sockets bound to the worker that created them.
//!
//! `bind`, `accept`, `connect`, `send` and `recv` must run inside a worker
//! task: each asynchronous operation enqueues its request on the completion
//! queue of the current worker, and the resulting socket belongs to that
//! worker for the rest of its life.

use crate::net::addr;
use crate::net::ops::{AcceptOp, ConnectOp, Op, RecvOp, SendOp};
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::time::Duration;

#[cfg(target_os = "linux")]
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType};
#[cfg(target_os = "linux")]
use nix::sys::time::TimeVal;
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

#[cfg(windows)]
use crate::net::OwnedSocket;
#[cfg(windows)]
use windows_sys::Win32::Networking::WinSock::{self as winsock, LPFN_ACCEPTEX, SOCKET};

/// A listening TCP socket.
pub struct TcpServer {
    #[cfg(target_os = "linux")]
    socket: OwnedFd,

    #[cfg(windows)]
    socket: OwnedSocket,

    #[cfg(windows)]
    accept_ex: LPFN_ACCEPTEX,

    local: SocketAddr,
}

impl TcpServer {
    /// Creates a socket bound to `addr` and starts listening with the
    /// maximum backlog. Address reuse is enabled so restarted servers do not
    /// trip over sockets lingering in TIME_WAIT.
    ///
    /// Must be called from inside a worker task.
    #[cfg(target_os = "linux")]
    pub fn bind(addr: SocketAddr) -> io::Result<TcpServer> {
        let socket = new_tcp_socket(&addr)?;

        socket::setsockopt(&socket, sockopt::ReuseAddr, &true).map_err(errno_to_io)?;
        socket::setsockopt(&socket, sockopt::ReusePort, &true).map_err(errno_to_io)?;

        let (raw, len) = addr::socket_addr_to_c(&addr);
        if unsafe { libc::bind(socket.as_raw_fd(), raw.as_ptr(), len) } != 0 {
            return Err(io::Error::last_os_error());
        }

        socket::listen(&socket, Backlog::MAXCONN).map_err(errno_to_io)?;

        let local = local_addr_of(socket.as_raw_fd())?;
        Ok(TcpServer { socket, local })
    }

    #[cfg(windows)]
    pub fn bind(addr: SocketAddr) -> io::Result<TcpServer> {
        let socket = new_overlapped_socket(&addr)?;

        let enable: u32 = 1;
        let rc = unsafe {
            winsock::setsockopt(
                socket.raw(),
                winsock::SOL_SOCKET as i32,
                winsock::SO_REUSEADDR as i32,
                std::ptr::from_ref(&enable).cast(),
                size_of::<u32>() as i32,
            )
        };
        if rc != 0 {
            return Err(last_wsa_error());
        }

        let (raw, len) = addr::socket_addr_to_c(&addr);
        if unsafe { winsock::bind(socket.raw(), raw.as_ptr(), len) } != 0 {
            return Err(last_wsa_error());
        }

        if unsafe { winsock::listen(socket.raw(), winsock::SOMAXCONN as i32) } != 0 {
            return Err(last_wsa_error());
        }

        // Completions for AcceptEx requests arrive on this worker's port.
        crate::runtime::worker::with_muxer(|muxer| muxer.register(socket.raw()))?;

        let accept_ex: LPFN_ACCEPTEX = unsafe {
            std::mem::transmute(crate::net::ops::wsa_extension(
                socket.raw(),
                &winsock::WSAID_ACCEPTEX,
            )?)
        };

        let local = local_addr_of(socket.raw())?;
        Ok(TcpServer {
            socket,
            accept_ex,
            local,
        })
    }

    /// The address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Waits for one incoming connection. The accepted stream belongs to
    /// the worker running the accept.
    #[cfg(target_os = "linux")]
    pub fn accept(&self) -> Op<AcceptOp<'_>> {
        Op::new(AcceptOp::new(&self.socket))
    }

    #[cfg(windows)]
    pub fn accept(&self) -> Op<AcceptOp<'_>> {
        Op::new(AcceptOp::new(&self.socket, self.accept_ex))
    }
}

/// A connected TCP stream.
pub struct TcpStream {
    #[cfg(target_os = "linux")]
    socket: OwnedFd,

    #[cfg(windows)]
    socket: OwnedSocket,

    peer: SocketAddr,
}

impl TcpStream {
    #[cfg(target_os = "linux")]
    pub(crate) fn from_parts(socket: OwnedFd, peer: SocketAddr) -> TcpStream {
        TcpStream { socket, peer }
    }

    #[cfg(windows)]
    pub(crate) fn from_parts(socket: OwnedSocket, peer: SocketAddr) -> TcpStream {
        TcpStream { socket, peer }
    }

    /// Opens a connection to `addr`. The new socket is created, connected
    /// and owned by the current worker; on failure the half-open socket is
    /// closed before the error is returned.
    pub fn connect(addr: SocketAddr) -> Op<ConnectOp> {
        Op::new(ConnectOp::new(addr))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sends bytes from `buf`, resolving to the number actually queued by
    /// the kernel. Short writes are normal under backpressure.
    pub fn send<'a>(&'a self, buf: &'a [u8]) -> Op<SendOp<'a>> {
        Op::new(SendOp::new(self.raw(), buf))
    }

    /// Receives into `buf`, resolving to the number of bytes read. Zero
    /// means the peer shut down the connection.
    pub fn recv<'a>(&'a self, buf: &'a mut [u8]) -> Op<RecvOp<'a>> {
        Op::new(RecvOp::new(self.raw(), buf))
    }

    #[cfg(target_os = "linux")]
    fn raw(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    #[cfg(windows)]
    fn raw(&self) -> SOCKET {
        self.socket.raw()
    }

    #[cfg(target_os = "linux")]
    pub fn set_keep_alive(&self, enabled: bool) -> io::Result<()> {
        socket::setsockopt(&self.socket, sockopt::KeepAlive, &enabled).map_err(errno_to_io)
    }

    #[cfg(target_os = "linux")]
    pub fn set_no_delay(&self, enabled: bool) -> io::Result<()> {
        socket::setsockopt(&self.socket, sockopt::TcpNoDelay, &enabled).map_err(errno_to_io)
    }

    /// Kernel-level send timeout with millisecond granularity; zero means
    /// wait forever.
    #[cfg(target_os = "linux")]
    pub fn set_send_timeout(&self, timeout: Duration) -> io::Result<()> {
        socket::setsockopt(&self.socket, sockopt::SendTimeout, &timeval(timeout))
            .map_err(errno_to_io)
    }

    /// Kernel-level receive timeout with millisecond granularity; zero
    /// means wait forever.
    #[cfg(target_os = "linux")]
    pub fn set_receive_timeout(&self, timeout: Duration) -> io::Result<()> {
        socket::setsockopt(&self.socket, sockopt::ReceiveTimeout, &timeval(timeout))
            .map_err(errno_to_io)
    }

    #[cfg(windows)]
    pub fn set_keep_alive(&self, enabled: bool) -> io::Result<()> {
        self.set_u32_option(
            winsock::SOL_SOCKET as i32,
            winsock::SO_KEEPALIVE as i32,
            enabled as u32,
        )
    }

    #[cfg(windows)]
    pub fn set_no_delay(&self, enabled: bool) -> io::Result<()> {
        self.set_u32_option(
            winsock::IPPROTO_TCP,
            winsock::TCP_NODELAY as i32,
            enabled as u32,
        )
    }

    /// Kernel-level send timeout with millisecond granularity; zero means
    /// wait forever.
    #[cfg(windows)]
    pub fn set_send_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_u32_option(
            winsock::SOL_SOCKET as i32,
            winsock::SO_SNDTIMEO as i32,
            timeout.as_millis() as u32,
        )
    }

    /// Kernel-level receive timeout with millisecond granularity; zero
    /// means wait forever.
    #[cfg(windows)]
    pub fn set_receive_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_u32_option(
            winsock::SOL_SOCKET as i32,
            winsock::SO_RCVTIMEO as i32,
            timeout.as_millis() as u32,
        )
    }

    #[cfg(windows)]
    fn set_u32_option(&self, level: i32, option: i32, value: u32) -> io::Result<()> {
        let rc = unsafe {
            winsock::setsockopt(
                self.socket.raw(),
                level,
                option,
                std::ptr::from_ref(&value).cast(),
                size_of::<u32>() as i32,
            )
        };
        if rc != 0 {
            return Err(last_wsa_error());
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn timeval(timeout: Duration) -> TimeVal {
    TimeVal::new(
        timeout.as_secs() as libc::time_t,
        timeout.subsec_micros() as libc::suseconds_t,
    )
}

#[cfg(target_os = "linux")]
pub(crate) fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// A fresh TCP socket of `addr`'s family, close-on-exec.
#[cfg(target_os = "linux")]
pub(crate) fn new_tcp_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };

    socket::socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(errno_to_io)
}

#[cfg(target_os = "linux")]
pub(crate) fn local_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    if unsafe { libc::getsockname(fd, storage.as_mut_ptr().cast(), &mut len) } != 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe { addr::socket_addr_from_c(storage.as_ptr(), len as usize) }
}

#[cfg(windows)]
pub(crate) fn last_wsa_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { winsock::WSAGetLastError() })
}

/// A fresh overlapped TCP socket of `addr`'s family.
#[cfg(windows)]
pub(crate) fn new_overlapped_socket(addr: &SocketAddr) -> io::Result<OwnedSocket> {
    let family = match addr {
        SocketAddr::V4(_) => winsock::AF_INET,
        SocketAddr::V6(_) => winsock::AF_INET6,
    };

    let socket = unsafe {
        winsock::WSASocketW(
            family as i32,
            winsock::SOCK_STREAM as i32,
            winsock::IPPROTO_TCP,
            std::ptr::null(),
            0,
            winsock::WSA_FLAG_OVERLAPPED | winsock::WSA_FLAG_NO_HANDLE_INHERIT,
        )
    };

    if socket == winsock::INVALID_SOCKET {
        return Err(last_wsa_error());
    }
    Ok(OwnedSocket::from_raw(socket))
}

/// Binds `socket` to the wildcard address of `addr`'s family, as `ConnectEx`
/// requires.
#[cfg(windows)]
pub(crate) fn bind_any(socket: SOCKET, addr: &SocketAddr) -> io::Result<()> {
    use std::net::{Ipv4Addr, Ipv6Addr};

    let any: SocketAddr = match addr {
        SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    };

    let (raw, len) = addr::socket_addr_to_c(&any);
    if unsafe { winsock::bind(socket, raw.as_ptr(), len) } != 0 {
        return Err(last_wsa_error());
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn local_addr_of(socket: SOCKET) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<winsock::SOCKADDR_STORAGE> = MaybeUninit::zeroed();
    let mut len = size_of::<winsock::SOCKADDR_STORAGE>() as i32;

    if unsafe { winsock::getsockname(socket, storage.as_mut_ptr().cast(), &mut len) } != 0 {
        return Err(last_wsa_error());
    }

    unsafe { addr::socket_addr_from_c(storage.as_ptr(), len as usize) }
}

#[cfg(windows)]
pub(crate) fn peer_addr_of(socket: SOCKET) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<winsock::SOCKADDR_STORAGE> = MaybeUninit::zeroed();
    let mut len = size_of::<winsock::SOCKADDR_STORAGE>() as i32;

    if unsafe { winsock::getpeername(socket, storage.as_mut_ptr().cast(), &mut len) } != 0 {
        return Err(last_wsa_error());
    }

    unsafe { addr::socket_addr_from_c(storage.as_ptr(), len as usize) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{schedule, spawn, Runtime};
    use crate::task::test_support;
    use anyhow::Result;
    use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
    use std::sync::Arc;

    const PACKET_COUNT: usize = 1000;
    const PACKET_SIZE: usize = 1024;

    async fn echo(stream: TcpStream) {
        let mut buffer = [0u8; PACKET_SIZE];
        let mut total = 0;

        while total < PACKET_COUNT * PACKET_SIZE {
            let received = match stream.recv(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n as usize,
            };
            total += received;

            let mut sent = 0;
            while sent < received {
                match stream.send(&buffer[sent..received]).await {
                    Ok(n) => sent += n as usize,
                    Err(_) => return,
                }
            }
        }
    }

    #[test]
    fn tcp_ping_pong() -> Result<()> {
        let _serial = test_support::serial_guard();

        let runtime = Runtime::new(1)?;
        let stopper = runtime.stopper();
        let ok = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&ok);

        runtime.dispatch(move || {
            let stopper = stopper.clone();
            let ok = Arc::clone(&ok);
            async move {
                let addr: SocketAddr = "[::1]:23333".parse().unwrap();

                let server = TcpServer::bind(addr).expect("bind failed");
                assert_eq!(server.local_addr(), addr);

                let listener = spawn(async move {
                    let stream = server.accept().await.expect("accept failed");
                    schedule(echo(stream));
                });

                let client = spawn(async move {
                    let stream = TcpStream::connect(addr).await.expect("connect failed");
                    assert_eq!(stream.peer_addr(), addr);

                    stream.set_keep_alive(true).expect("keep-alive failed");
                    stream.set_no_delay(true).expect("no-delay failed");
                    stream
                        .set_send_timeout(Duration::from_secs(30))
                        .expect("send timeout failed");
                    stream
                        .set_receive_timeout(Duration::from_secs(65))
                        .expect("receive timeout failed");

                    let payload = [7u8; PACKET_SIZE];
                    let mut incoming = [0u8; PACKET_SIZE];
                    let mut sent_total = 0;
                    let mut received_total = 0;

                    for _ in 0..PACKET_COUNT {
                        let mut sent = 0;
                        while sent < PACKET_SIZE {
                            sent +=
                                stream.send(&payload[sent..]).await.expect("send failed") as usize;
                        }
                        sent_total += sent;

                        let mut received = 0;
                        while received < PACKET_SIZE {
                            let n = stream
                                .recv(&mut incoming[received..])
                                .await
                                .expect("recv failed") as usize;
                            assert_ne!(n, 0, "peer closed early");
                            received += n;
                        }
                        received_total += received;

                        assert_eq!(incoming, payload, "payload corrupted in transit");
                    }

                    (sent_total, received_total)
                });

                listener.await;
                let (sent, received) = client.await;

                if sent == PACKET_COUNT * PACKET_SIZE && received == PACKET_COUNT * PACKET_SIZE {
                    ok.store(true, Relaxed);
                }
                stopper.stop();
            }
        });

        runtime.run();
        assert!(observed.load(Relaxed), "ping-pong did not complete cleanly");
        Ok(())
    }

    #[test]
    fn accept_after_stop_reports_aborted_error() -> Result<()> {
        let _serial = test_support::serial_guard();

        let runtime = Runtime::new(1)?;
        let stopper = runtime.stopper();
        let ok = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&ok);

        runtime.dispatch(move || {
            let stopper = stopper.clone();
            let ok = Arc::clone(&ok);
            async move {
                let addr: SocketAddr = "[::1]:23335".parse().unwrap();
                let server = TcpServer::bind(addr).expect("bind failed");

                // The worker is now stopping; arming the accept would
                // strand it past the final queue pump.
                stopper.stop();

                #[cfg(target_os = "linux")]
                let aborted = libc::ECANCELED;
                #[cfg(windows)]
                let aborted =
                    windows_sys::Win32::Foundation::ERROR_OPERATION_ABORTED as i32;

                match server.accept().await {
                    Err(e) if e.raw_os_error() == Some(aborted) => ok.store(true, Relaxed),
                    Err(e) => panic!("unexpected error after stop: {e}"),
                    Ok(_) => panic!("accept succeeded on a stopping worker"),
                }
            }
        });

        runtime.run();
        assert!(observed.load(Relaxed), "aborted accept was not surfaced");
        Ok(())
    }

    #[test]
    fn connect_refused_is_an_error_not_a_panic() -> Result<()> {
        let _serial = test_support::serial_guard();

        let runtime = Runtime::new(1)?;
        let stopper = runtime.stopper();
        let ok = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&ok);

        runtime.dispatch(move || {
            let stopper = stopper.clone();
            let ok = Arc::clone(&ok);
            async move {
                // TCP port 1 on loopback: nothing listens there.
                let addr: SocketAddr = "[::1]:1".parse().unwrap();

                match TcpStream::connect(addr).await {
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        ok.store(true, Relaxed);
                    }
                    Err(e) => panic!("unexpected error kind: {e}"),
                    Ok(_) => panic!("connect to a dead port succeeded"),
                }
                stopper.stop();
            }
        });

        runtime.run();
        assert!(observed.load(Relaxed), "refused connect was not surfaced");
        Ok(())
    }

    /// WSASend on an unsaturated connection finishes inline; the task keeps
    /// running and nothing passes through the wake list.
    #[cfg(windows)]
    #[test]
    fn small_send_completes_synchronously() -> Result<()> {
        use crate::runtime::worker;
        use std::future::Future as _;
        use std::pin::pin;
        use std::task::Poll;

        let _serial = test_support::serial_guard();

        let runtime = Runtime::new(1)?;
        let stopper = runtime.stopper();
        let ok = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&ok);

        runtime.dispatch(move || {
            let stopper = stopper.clone();
            let ok = Arc::clone(&ok);
            async move {
                let addr: SocketAddr = "127.0.0.1:23334".parse().unwrap();
                let server = TcpServer::bind(addr).expect("bind failed");

                let accepted = spawn(async move { server.accept().await });
                let stream = TcpStream::connect(addr).await.expect("connect failed");
                let _peer = accepted.await.expect("accept failed");

                let payload = [9u8; 16];
                let before = worker::current_wake_list_len();

                let mut op = pin!(stream.send(&payload));
                let first_poll =
                    futures::future::poll_fn(|cx| Poll::Ready(op.as_mut().poll(cx))).await;

                match first_poll {
                    Poll::Ready(Ok(n)) => {
                        assert_eq!(n as usize, payload.len());
                        assert_eq!(worker::current_wake_list_len(), before);
                        ok.store(true, Relaxed);
                    }
                    Poll::Ready(Err(e)) => panic!("synchronous send failed: {e}"),
                    Poll::Pending => {
                        // Drain the armed operation before judging the test.
                        let _ = futures::future::poll_fn(|cx| op.as_mut().poll(cx)).await;
                    }
                }
                stopper.stop();
            }
        });

        runtime.run();
        assert!(observed.load(Relaxed), "send took the queued path");
        Ok(())
    }
}
