//! TCP networking over the per-worker completion queues.

pub(crate) mod addr;

pub(crate) mod ops;
pub use ops::{AcceptOp, ConnectOp, Op, RecvOp, SendOp};

pub(crate) mod tcp;
pub use tcp::{TcpServer, TcpStream};

/// Owned WinSock socket handle, closed on drop.
#[cfg(windows)]
pub(crate) struct OwnedSocket(windows_sys::Win32::Networking::WinSock::SOCKET);

#[cfg(windows)]
impl OwnedSocket {
    pub(crate) fn from_raw(socket: windows_sys::Win32::Networking::WinSock::SOCKET) -> OwnedSocket {
        OwnedSocket(socket)
    }

    pub(crate) fn raw(&self) -> windows_sys::Win32::Networking::WinSock::SOCKET {
        self.0
    }
}

#[cfg(windows)]
impl Drop for OwnedSocket {
    fn drop(&mut self) {
        unsafe { windows_sys::Win32::Networking::WinSock::closesocket(self.0) };
    }
}
