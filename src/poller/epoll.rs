use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::{Channel, INDEX_NEW};
use crate::event::EventSet;

/// Channel registration states kept in the channel's poller index slot.
const INDEX_ADDED: i32 = 1;
const INDEX_DELETED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// The epoll(7) backend.
///
/// Registration is level-triggered: a readable descriptor keeps reporting
/// until it is drained, which is what the one-accept-per-event and
/// partial-write paths upstream rely on.
///
/// A channel whose interest becomes empty is deleted from the epoll set but
/// stays in the fd map in the `Deleted` state, making a later re-enable a
/// cheap `EPOLL_CTL_ADD` without rebuilding bookkeeping.
pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl std::fmt::Debug for EpollPoller {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("EpollPoller")
            .field("epoll_fd", &self.epoll_fd)
            .field("capacity", &self.events.capacity())
            .finish()
    }
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: epoll_create1(2) returned a valid, owned descriptor.
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Vec::with_capacity(INIT_EVENT_LIST_SIZE),
        })
    }

    pub(crate) fn poll(
        &mut self,
        channels: &HashMap<RawFd, Rc<Channel>>,
        timeout: Duration,
        active_channels: &mut Vec<Rc<Channel>>,
    ) -> Instant {
        let timeout_ms = timeout.as_millis() as libc::c_int;
        self.events.clear();
        let result = syscall!(epoll_wait(
            self.epoll_fd.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ms,
        ));
        let now = Instant::now();
        match result {
            Ok(num_events) => {
                // SAFETY: epoll_wait(2) initialised `num_events` entries.
                unsafe { self.events.set_len(num_events as usize) };
                trace!("{} events happened", num_events);
                for event in &self.events {
                    let fd = event.u64 as RawFd;
                    let channel = &channels[&fd];
                    channel.set_revents(EventSet::from_epoll(event.events));
                    active_channels.push(Rc::clone(channel));
                }
                // Double the event list when the kernel filled it; there
                // may be more readiness than fits in one wait.
                if self.events.len() == self.events.capacity() {
                    self.events.reserve(self.events.capacity());
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("epoll_wait: {}", err),
        }
        now
    }

    pub(crate) fn update_channel(
        &mut self,
        channels: &mut HashMap<RawFd, Rc<Channel>>,
        channel: &Rc<Channel>,
    ) {
        let index = channel.index();
        let fd = channel.fd();
        trace!(
            "epoll update fd={} events={{{:?}}} index={}",
            fd,
            channel.events(),
            index
        );
        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                assert!(!channels.contains_key(&fd));
                channels.insert(fd, Rc::clone(channel));
            } else {
                assert!(channels
                    .get(&fd)
                    .is_some_and(|found| Rc::ptr_eq(found, channel)));
            }
            channel.set_index(INDEX_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(channels
                .get(&fd)
                .is_some_and(|found| Rc::ptr_eq(found, channel)));
            assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DELETED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    pub(crate) fn remove_channel(
        &mut self,
        channels: &mut HashMap<RawFd, Rc<Channel>>,
        channel: &Rc<Channel>,
    ) {
        let fd = channel.fd();
        trace!("epoll remove fd={}", fd);
        assert!(channels
            .get(&fd)
            .is_some_and(|found| Rc::ptr_eq(found, channel)));
        assert!(channel.is_none_event());
        let index = channel.index();
        assert!(index == INDEX_ADDED || index == INDEX_DELETED);
        channels.remove(&fd);

        if index == INDEX_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn ctl(&self, operation: libc::c_int, channel: &Rc<Channel>) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.events().to_epoll(),
            u64: fd as u64,
        };
        trace!(
            "epoll_ctl op={} fd={} events={{{:?}}}",
            operation_name(operation),
            fd,
            channel.events()
        );
        let event_ptr: *mut libc::epoll_event = if operation == libc::EPOLL_CTL_DEL {
            ptr::null_mut()
        } else {
            &mut event
        };
        if let Err(err) = syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), operation, fd, event_ptr))
        {
            if operation == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl op=DEL fd={}: {}", fd, err);
            } else {
                panic!(
                    "epoll_ctl op={} fd={}: {}",
                    operation_name(operation),
                    fd,
                    err
                );
            }
        }
    }
}

fn operation_name(operation: libc::c_int) -> &'static str {
    match operation {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_DEL => "DEL",
        libc::EPOLL_CTL_MOD => "MOD",
        _ => unreachable!("bad epoll_ctl operation"),
    }
}
