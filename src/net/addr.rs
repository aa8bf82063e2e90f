//! Conversions between `std::net` socket addresses and the C representations
//! the kernel interfaces take. Address *parsing* stays entirely on the
//! `std::net` side; nothing here ever panics on malformed input from the OS.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

#[cfg(target_os = "linux")]
mod sys {
    pub(super) use libc::{
        sa_family_t, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t, AF_INET,
        AF_INET6,
    };

    pub(super) use libc::{in6_addr, in_addr};
}

#[cfg(windows)]
mod sys {
    pub(super) use windows_sys::Win32::Networking::WinSock::{
        ADDRESS_FAMILY as sa_family_t, AF_INET, AF_INET6, IN6_ADDR as in6_addr,
        IN_ADDR as in_addr, SOCKADDR as sockaddr, SOCKADDR_IN as sockaddr_in,
        SOCKADDR_IN6 as sockaddr_in6, SOCKADDR_STORAGE as sockaddr_storage,
    };

    pub(super) type socklen_t = i32;
}

/// A socket address in the layout the OS expects, large enough for either
/// family. The pointer handed to the kernel comes from a pinned instance of
/// this union.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: sys::sockaddr_in,
    v6: sys::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const sys::sockaddr {
        std::ptr::from_ref(self).cast()
    }
}

pub(crate) fn socket_addr_to_c(addr: &SocketAddr) -> (SocketAddrCRepr, sys::socklen_t) {
    match addr {
        SocketAddr::V4(a) => {
            let repr = SocketAddrCRepr {
                v4: socket_addr_v4_to_c(a),
            };
            (repr, size_of::<sys::sockaddr_in>() as sys::socklen_t)
        }
        SocketAddr::V6(a) => {
            let repr = SocketAddrCRepr {
                v6: socket_addr_v6_to_c(a),
            };
            (repr, size_of::<sys::sockaddr_in6>() as sys::socklen_t)
        }
    }
}

/// Reads a kernel-written sockaddr back into a `std` address.
///
/// Safety: `storage` must point at least `len` initialised bytes of a
/// kernel-produced sockaddr.
pub(crate) unsafe fn socket_addr_from_c(
    storage: *const sys::sockaddr_storage,
    len: usize,
) -> io::Result<SocketAddr> {
    let family = unsafe { (*storage.cast::<sys::sockaddr>()).sa_family };
    match family as i32 {
        af if af == sys::AF_INET as i32 => {
            if len < size_of::<sys::sockaddr_in>() {
                return Err(truncated());
            }
            let addr = unsafe { *storage.cast::<sys::sockaddr_in>() };
            Ok(SocketAddr::V4(socket_addr_v4_from_c(addr)))
        }
        af if af == sys::AF_INET6 as i32 => {
            if len < size_of::<sys::sockaddr_in6>() {
                return Err(truncated());
            }
            let addr = unsafe { *storage.cast::<sys::sockaddr_in6>() };
            Ok(SocketAddr::V6(socket_addr_v6_from_c(addr)))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported address family",
        )),
    }
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "truncated socket address")
}

#[cfg(target_os = "linux")]
fn socket_addr_v4_to_c(addr: &SocketAddrV4) -> sys::sockaddr_in {
    sys::sockaddr_in {
        sin_family: sys::AF_INET as sys::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: ip_v4_addr_to_c(addr.ip()),
        ..unsafe { std::mem::zeroed() }
    }
}

#[cfg(target_os = "linux")]
fn socket_addr_v6_to_c(addr: &SocketAddrV6) -> sys::sockaddr_in6 {
    sys::sockaddr_in6 {
        sin6_family: sys::AF_INET6 as sys::sa_family_t,
        sin6_port: addr.port().to_be(),
        sin6_addr: ip_v6_addr_to_c(addr.ip()),
        sin6_flowinfo: addr.flowinfo(),
        sin6_scope_id: addr.scope_id(),
    }
}

#[cfg(target_os = "linux")]
fn socket_addr_v4_from_c(addr: sys::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(addr.sin_port),
    )
}

#[cfg(target_os = "linux")]
fn socket_addr_v6_from_c(addr: sys::sockaddr_in6) -> SocketAddrV6 {
    SocketAddrV6::new(
        Ipv6Addr::from(addr.sin6_addr.s6_addr),
        u16::from_be(addr.sin6_port),
        addr.sin6_flowinfo,
        addr.sin6_scope_id,
    )
}

#[cfg(target_os = "linux")]
fn ip_v4_addr_to_c(addr: &Ipv4Addr) -> sys::in_addr {
    // `s_addr` is stored big-endian on every machine and the octet array is
    // already in that order, so the native-endian conversion never swaps.
    sys::in_addr {
        s_addr: u32::from_ne_bytes(addr.octets()),
    }
}

#[cfg(target_os = "linux")]
fn ip_v6_addr_to_c(addr: &Ipv6Addr) -> sys::in6_addr {
    sys::in6_addr {
        s6_addr: addr.octets(),
    }
}

#[cfg(windows)]
fn socket_addr_v4_to_c(addr: &SocketAddrV4) -> sys::sockaddr_in {
    let mut out: sys::sockaddr_in = unsafe { std::mem::zeroed() };
    out.sin_family = sys::AF_INET;
    out.sin_port = addr.port().to_be();
    out.sin_addr.S_un.S_addr = u32::from_ne_bytes(addr.ip().octets());
    out
}

#[cfg(windows)]
fn socket_addr_v6_to_c(addr: &SocketAddrV6) -> sys::sockaddr_in6 {
    let mut out: sys::sockaddr_in6 = unsafe { std::mem::zeroed() };
    out.sin6_family = sys::AF_INET6;
    out.sin6_port = addr.port().to_be();
    out.sin6_addr.u.Byte = addr.ip().octets();
    out.sin6_flowinfo = addr.flowinfo();
    out.Anonymous.sin6_scope_id = addr.scope_id();
    out
}

#[cfg(windows)]
fn socket_addr_v4_from_c(addr: sys::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(unsafe { addr.sin_addr.S_un.S_addr }.to_ne_bytes());
    SocketAddrV4::new(ip, u16::from_be(addr.sin_port))
}

#[cfg(windows)]
fn socket_addr_v6_from_c(addr: sys::sockaddr_in6) -> SocketAddrV6 {
    let ip = Ipv6Addr::from(unsafe { addr.sin6_addr.u.Byte });
    SocketAddrV6::new(
        ip,
        u16::from_be(addr.sin6_port),
        addr.sin6_flowinfo,
        unsafe { addr.Anonymous.sin6_scope_id },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::IpAddr;

    #[rstest]
    #[case::v4_loopback("127.0.0.1:8080")]
    #[case::v4_any("0.0.0.0:0")]
    #[case::v6_loopback("[::1]:23333")]
    #[case::v6_mapped("[::ffff:192.0.2.1]:443")]
    fn c_repr_round_trip(#[case] text: &str) {
        let addr: SocketAddr = text.parse().unwrap();
        let (repr, len) = socket_addr_to_c(&addr);

        let parsed = unsafe {
            socket_addr_from_c(
                std::ptr::from_ref(&repr).cast::<sys::sockaddr_storage>(),
                len as usize,
            )
        }
        .unwrap();

        assert_eq!(parsed, addr);
    }

    #[rstest]
    #[case(127, 0, 0, 1)]
    #[case(0, 0, 0, 0)]
    #[case(255, 255, 255, 255)]
    #[case(192, 0, 2, 123)]
    fn octets_and_text_forms_agree(#[case] a: u8, #[case] b: u8, #[case] c: u8, #[case] d: u8) {
        let from_octets = Ipv4Addr::new(a, b, c, d);
        let from_text: Ipv4Addr = format!("{a}.{b}.{c}.{d}").parse().unwrap();
        assert_eq!(from_octets, from_text);
    }

    #[test]
    fn address_and_port_survive_socket_addr() {
        let ip: IpAddr = "2001:db8::7".parse().unwrap();
        let addr = SocketAddr::new(ip, 23333);
        assert_eq!(addr.ip(), ip);
        assert_eq!(addr.port(), 23333);
    }

    #[test]
    fn out_of_range_octet_fails_to_parse() {
        // Structured error, not a panic.
        assert!("255.123.255.345".parse::<Ipv4Addr>().is_err());
        assert!("255.123.255.345:80".parse::<SocketAddr>().is_err());
    }

    #[test]
    fn mapped_v6_round_trips_to_v4_broadcast() {
        let mapped: Ipv6Addr = "::ffff:255.255.255.255".parse().unwrap();
        assert!(mapped.to_ipv4_mapped().is_some());
        assert_eq!(mapped.to_ipv4_mapped(), Some(Ipv4Addr::BROADCAST));
        assert_eq!(Ipv4Addr::BROADCAST.to_ipv6_mapped(), mapped);
    }
}
