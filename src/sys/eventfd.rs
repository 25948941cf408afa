use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::error;

/// Loop wakeup descriptor backed by `eventfd(2)`.
///
/// An eventfd is a 64 bit counter. Writes must be 8 bytes and add to the
/// count; reads must be 8 bytes and reset the count to 0. The owning loop
/// keeps the descriptor registered for read interest permanently, so a
/// single write from any thread interrupts an in-progress poll.
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub(crate) fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: eventfd(2) returned a valid, owned descriptor.
        Ok(EventFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn wake(&self) {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        )) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The counter would overflow. Reset it and try once more.
                self.drain();
                let _ = syscall!(write(
                    self.fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len()
                ));
            }
            Err(err) => error!("eventfd wakeup write failed: {}", err),
        }
    }

    /// Resets the counter. Called by the owning loop on every readable event.
    pub(crate) fn drain(&self) {
        let mut buf: [u8; 8] = [0; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            Ok(n) if n as usize == buf.len() => {}
            Ok(n) => error!("eventfd drain read {} bytes instead of 8", n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("eventfd drain failed: {}", err),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
