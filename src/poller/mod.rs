//! The multiplexer façade: one `Poller` per event loop.

mod epoll;
mod poll;

use std::collections::HashMap;
use std::env;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::trace;

use crate::channel::Channel;

use self::epoll::EpollPoller;
use self::poll::PollPoller;

/// Environment variable selecting the poll(2) backend. Any non-empty value
/// enables it; the default backend is epoll.
pub(crate) const USE_POLL_ENV: &str = "MUXIO_USE_POLL";

/// Per-loop readiness multiplexer.
///
/// Keeps the authoritative fd to channel mapping and delegates the kernel
/// interaction to the selected backend. After every `update_channel` the
/// kernel's registered interest set for the descriptor equals the
/// channel's; the mapping is only touched from the owning loop's thread.
#[derive(Debug)]
pub(crate) struct Poller {
    channels: HashMap<RawFd, Rc<Channel>>,
    backend: Backend,
}

#[derive(Debug)]
enum Backend {
    Epoll(EpollPoller),
    Poll(PollPoller),
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let backend = if env::var_os(USE_POLL_ENV).is_some_and(|v| !v.is_empty()) {
            trace!("using poll(2) backend");
            Backend::Poll(PollPoller::new())
        } else {
            Backend::Epoll(EpollPoller::new()?)
        };
        Ok(Poller {
            channels: HashMap::new(),
            backend,
        })
    }

    /// Blocks for up to `timeout`, fills `active_channels` with channels
    /// carrying readiness (their `revents` already set, kernel order), and
    /// returns the time of the wake. `EINTR` is swallowed.
    pub(crate) fn poll(
        &mut self,
        timeout: Duration,
        active_channels: &mut Vec<Rc<Channel>>,
    ) -> Instant {
        trace!("fd total count {}", self.channels.len());
        match &mut self.backend {
            Backend::Epoll(epoll) => epoll.poll(&self.channels, timeout, active_channels),
            Backend::Poll(poll) => poll.poll(&self.channels, timeout, active_channels),
        }
    }

    /// Synchronises the kernel registration with `channel.events()`.
    pub(crate) fn update_channel(&mut self, channel: &Rc<Channel>) {
        match &mut self.backend {
            Backend::Epoll(epoll) => epoll.update_channel(&mut self.channels, channel),
            Backend::Poll(poll) => poll.update_channel(&mut self.channels, channel),
        }
    }

    /// Drops the kernel registration and the fd mapping. The channel's
    /// interest set must already be empty.
    pub(crate) fn remove_channel(&mut self, channel: &Rc<Channel>) {
        match &mut self.backend {
            Backend::Epoll(epoll) => epoll.remove_channel(&mut self.channels, channel),
            Backend::Poll(poll) => poll.remove_channel(&mut self.channels, channel),
        }
    }

    pub(crate) fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|found| Rc::ptr_eq(found, channel))
    }
}
