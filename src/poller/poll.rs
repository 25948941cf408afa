use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::{Channel, INDEX_NEW};
use crate::event::EventSet;

/// The poll(2) fallback backend.
///
/// Maintains a flat `pollfd` array; each registered channel remembers its
/// slot in its poller index. A channel with an empty interest set keeps its
/// slot but has the slot's descriptor negated, which poll(2) ignores, so
/// re-enabling is cheap.
#[derive(Default)]
pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
}

impl std::fmt::Debug for PollPoller {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("PollPoller")
            .field("slots", &self.pollfds.len())
            .finish()
    }
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller::default()
    }

    pub(crate) fn poll(
        &mut self,
        channels: &HashMap<RawFd, Rc<Channel>>,
        timeout: Duration,
        active_channels: &mut Vec<Rc<Channel>>,
    ) -> Instant {
        let timeout_ms = timeout.as_millis() as libc::c_int;
        let result = syscall!(poll(
            self.pollfds.as_mut_ptr(),
            self.pollfds.len() as libc::nfds_t,
            timeout_ms,
        ));
        let now = Instant::now();
        match result {
            Ok(mut num_events) => {
                trace!("{} events happened", num_events);
                for pollfd in &self.pollfds {
                    if num_events == 0 {
                        break;
                    }
                    if pollfd.revents == 0 {
                        continue;
                    }
                    num_events -= 1;
                    let channel = &channels[&pollfd.fd];
                    channel.set_revents(EventSet::from_poll(pollfd.revents));
                    active_channels.push(Rc::clone(channel));
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("poll: {}", err),
        }
        now
    }

    pub(crate) fn update_channel(
        &mut self,
        channels: &mut HashMap<RawFd, Rc<Channel>>,
        channel: &Rc<Channel>,
    ) {
        let fd = channel.fd();
        trace!(
            "poll update fd={} events={{{:?}}} index={}",
            fd,
            channel.events(),
            channel.index()
        );
        if channel.index() == INDEX_NEW {
            assert!(!channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: channel.events().to_poll(),
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            channels.insert(fd, Rc::clone(channel));
        } else {
            assert!(channels
                .get(&fd)
                .is_some_and(|found| Rc::ptr_eq(found, channel)));
            let index = channel.index() as usize;
            assert!(index < self.pollfds.len());
            let pollfd = &mut self.pollfds[index];
            assert!(pollfd.fd == fd || pollfd.fd == ignored_fd(fd));
            pollfd.fd = fd;
            pollfd.events = channel.events().to_poll();
            pollfd.revents = 0;
            if channel.is_none_event() {
                // Negate so poll(2) skips the slot.
                pollfd.fd = ignored_fd(fd);
            }
        }
    }

    pub(crate) fn remove_channel(
        &mut self,
        channels: &mut HashMap<RawFd, Rc<Channel>>,
        channel: &Rc<Channel>,
    ) {
        let fd = channel.fd();
        trace!("poll remove fd={}", fd);
        assert!(channels
            .get(&fd)
            .is_some_and(|found| Rc::ptr_eq(found, channel)));
        assert!(channel.is_none_event());
        let index = channel.index() as usize;
        assert!(index < self.pollfds.len());
        channels.remove(&fd);

        // Swap the freed slot with the last one and patch the index of the
        // channel that moved.
        let last = self.pollfds.len() - 1;
        if index != last {
            let mut moved_fd = self.pollfds[last].fd;
            if moved_fd < 0 {
                moved_fd = ignored_fd(moved_fd);
            }
            self.pollfds.swap(index, last);
            channels[&moved_fd].set_index(index as i32);
        }
        self.pollfds.pop();
        channel.set_index(INDEX_NEW);
    }
}

/// Maps a descriptor to the negative value poll(2) ignores, and back.
/// Plain negation would turn fd 0 into itself.
fn ignored_fd(fd: RawFd) -> RawFd {
    -fd - 1
}
