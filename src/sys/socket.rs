//! Non-blocking socket plumbing shared by the TCP layers.

use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// An owned stream socket.
///
/// Closing is handled by `OwnedFd`; everything else is a thin veneer over
/// the corresponding syscalls. All sockets created here are non-blocking
/// and close-on-exec from birth (`SOCK_NONBLOCK | SOCK_CLOEXEC`).
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub(crate) fn new_nonblocking(addr: &SocketAddr) -> io::Result<Socket> {
        let family = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP
        ))?;
        // SAFETY: socket(2) returned a valid, owned descriptor.
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn from_owned(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn into_owned(self) -> OwnedFd {
        self.fd
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw, len) = socket_addr(addr);
        syscall!(bind(self.fd(), raw.as_ptr(), len)).map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd(), libc::SOMAXCONN)).map(|_| ())
    }

    /// Accepts one pending connection, non-blocking and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ))?;
        // SAFETY: accept4(2) returned a valid, owned descriptor and filled
        // `storage` with the peer address.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((fd, addr))
    }

    /// Half-close: shuts down the write side, leaving the read side open.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd(), libc::SHUT_WR)).map(|_| ())
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr(self.fd())
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
    }
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, val: libc::c_int) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t
    ))
    .map(|_| ())
}

/// Starts a non-blocking connect. `Ok` means the connect completed
/// immediately; `EINPROGRESS` and friends are reported through the error so
/// the caller can decide between waiting and retrying.
pub(crate) fn start_connect(socket: &Socket, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr(addr);
    syscall!(connect(socket.fd(), raw.as_ptr(), len)).map(|_| ())
}

pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, data.as_ptr() as *const libc::c_void, data.len())).map(|n| n as usize)
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

/// Reads and clears the pending `SO_ERROR` on the socket. Returns the raw
/// errno value, 0 when the socket carries no error.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    match syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut optval as *mut libc::c_int as *mut libc::c_void,
        &mut len
    )) {
        Ok(_) => optval,
        Err(err) => err.raw_os_error().unwrap_or(0),
    }
}

/// A non-blocking connect through the loopback can land on its own source
/// port before the kernel assigns a distinct one.
pub(crate) fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

/// Opens the spare descriptor the acceptor keeps around for EMFILE recovery.
pub(crate) fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))?;
    // SAFETY: open(2) returned a valid, owned descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// `sockaddr_in` and `sockaddr_in6` carrier with a stable address, for
/// passing either family to the socket syscalls.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const SocketAddrCRepr as *const libc::sockaddr
    }
}

pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sin },
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sin6 },
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// # Safety
///
/// `storage` must point at a `sockaddr_storage` initialised by the kernel
/// as a `sockaddr_in` or `sockaddr_in6`.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match unsafe { (*storage).ss_family } as libc::c_int {
        libc::AF_INET => {
            let addr = unsafe { &*(storage as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = unsafe { &*(storage as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn v4_round_trip() {
        let addr: SocketAddr = "127.0.0.1:4567".parse().unwrap();
        let (raw, len) = socket_addr(&addr);
        assert_eq!(len as usize, size_of::<libc::sockaddr_in>());
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        unsafe {
            ptr::copy_nonoverlapping(
                raw.as_ptr() as *const u8,
                storage.as_mut_ptr() as *mut u8,
                len as usize,
            );
            assert_eq!(to_socket_addr(storage.as_ptr()).unwrap(), addr);
        }
    }

    #[test]
    fn v6_round_trip() {
        let addr: SocketAddr = "[::1]:9999".parse().unwrap();
        let (raw, len) = socket_addr(&addr);
        assert_eq!(len as usize, size_of::<libc::sockaddr_in6>());
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        unsafe {
            ptr::copy_nonoverlapping(
                raw.as_ptr() as *const u8,
                storage.as_mut_ptr() as *mut u8,
                len as usize,
            );
            assert_eq!(to_socket_addr(storage.as_ptr()).unwrap(), addr);
        }
    }

    #[test]
    fn bind_and_local_addr() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::new_nonblocking(&addr).unwrap();
        socket.set_reuse_addr(true).unwrap();
        socket.bind(&addr).unwrap();
        let bound = socket.local_addr().unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
    }
}
