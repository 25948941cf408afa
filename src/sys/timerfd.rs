use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::{Duration, Instant};

use log::{error, trace};

/// Kernel timer descriptor backed by `timerfd_create(2)`.
///
/// The descriptor is created against `CLOCK_MONOTONIC` and armed with
/// relative timeouts, which keeps it immune to wall-clock adjustments and
/// lines it up with `Instant` on the Rust side.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
        ))?;
        // SAFETY: timerfd_create(2) returned a valid, owned descriptor.
        Ok(TimerFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Arms the descriptor to expire at `when`.
    ///
    /// Expirations in the past are clamped to a small positive delay so the
    /// descriptor still fires instead of being disarmed by a zero timeout.
    pub(crate) fn arm(&self, when: Instant) {
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(Duration::from_micros(100));
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as _,
            },
        };
        if let Err(err) = syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &new_value,
            ptr::null_mut()
        )) {
            error!("timerfd_settime failed: {}", err);
        }
    }

    /// Drains the 8 byte expiration counter on a readable event.
    pub(crate) fn drain(&self) {
        let mut buf: [u8; 8] = [0; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            Ok(n) if n as usize == buf.len() => {
                trace!("timerfd fired {} time(s)", u64::from_ne_bytes(buf));
            }
            Ok(n) => error!("timerfd drain read {} bytes instead of 8", n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("timerfd drain failed: {}", err),
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
