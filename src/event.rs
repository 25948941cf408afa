use std::{fmt, ops};

// The constants of poll(2) and epoll(7) are expected to be the same on
// Linux; the conversions below rely on it.
const _: () = assert!(libc::EPOLLIN == libc::POLLIN as i32);
const _: () = assert!(libc::EPOLLPRI == libc::POLLPRI as i32);
const _: () = assert!(libc::EPOLLOUT == libc::POLLOUT as i32);
const _: () = assert!(libc::EPOLLERR == libc::POLLERR as i32);
const _: () = assert!(libc::EPOLLHUP == libc::POLLHUP as i32);
const _: () = assert!(libc::EPOLLRDHUP == libc::POLLRDHUP as i32);

/// A set of readiness events.
///
/// `EventSet` is used both as the interest a [`Channel`] registers with its
/// poller and as the events the poller reports back. Interests are built
/// from [`EventSet::READABLE`] and [`EventSet::WRITABLE`]; reported sets may
/// additionally carry error, hang-up and invalid-descriptor bits that cannot
/// be registered for explicitly.
///
/// [`Channel`]: crate::Channel
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EventSet(u32);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    /// Input readiness, `POLLIN | POLLPRI`.
    pub const READABLE: EventSet = EventSet(libc::POLLIN as u32 | libc::POLLPRI as u32);
    /// Output readiness, `POLLOUT`.
    pub const WRITABLE: EventSet = EventSet(libc::POLLOUT as u32);

    pub(crate) const IN: EventSet = EventSet(libc::POLLIN as u32);
    pub(crate) const PRI: EventSet = EventSet(libc::POLLPRI as u32);
    pub(crate) const OUT: EventSet = EventSet(libc::POLLOUT as u32);
    pub(crate) const ERR: EventSet = EventSet(libc::POLLERR as u32);
    pub(crate) const HUP: EventSet = EventSet(libc::POLLHUP as u32);
    pub(crate) const NVAL: EventSet = EventSet(libc::POLLNVAL as u32);
    pub(crate) const RDHUP: EventSet = EventSet(libc::POLLRDHUP as u32);

    /// Returns true if no event is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if all bits of `other` are set in `self`.
    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set in `self`.
    pub const fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns `self` with all bits of `other` removed.
    pub const fn without(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }

    /// Input of any kind: data, urgent data, or a peer half-close.
    pub(crate) const fn has_input(self) -> bool {
        self.intersects(EventSet(
            libc::POLLIN as u32 | libc::POLLPRI as u32 | libc::POLLRDHUP as u32,
        ))
    }

    pub(crate) const fn has_output(self) -> bool {
        self.contains(EventSet::OUT)
    }

    pub(crate) const fn has_error(self) -> bool {
        self.intersects(EventSet::ERR)
    }

    pub(crate) const fn has_hangup(self) -> bool {
        self.contains(EventSet::HUP)
    }

    pub(crate) const fn has_invalid(self) -> bool {
        self.contains(EventSet::NVAL)
    }

    pub(crate) fn to_epoll(self) -> u32 {
        // Level-triggered on purpose; see Poller.
        self.0
    }

    pub(crate) fn from_epoll(events: u32) -> EventSet {
        EventSet(events)
    }

    pub(crate) fn to_poll(self) -> libc::c_short {
        self.0 as libc::c_short
    }

    pub(crate) fn from_poll(revents: libc::c_short) -> EventSet {
        EventSet(revents as u16 as u32)
    }
}

impl ops::BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }
}

impl ops::BitOrAssign for EventSet {
    fn bitor_assign(&mut self, other: EventSet) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return fmt.write_str("NONE");
        }
        let bits = [
            (EventSet::IN, "IN"),
            (EventSet::PRI, "PRI"),
            (EventSet::OUT, "OUT"),
            (EventSet::ERR, "ERR"),
            (EventSet::HUP, "HUP"),
            (EventSet::NVAL, "NVAL"),
            (EventSet::RDHUP, "RDHUP"),
        ];
        let mut one = false;
        for (bit, name) in bits {
            if self.contains(bit) {
                if one {
                    fmt.write_str(" | ")?;
                }
                one = true;
                fmt.write_str(name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EventSet;

    #[test]
    fn interest_bits() {
        let mut set = EventSet::NONE;
        assert!(set.is_empty());

        set |= EventSet::READABLE;
        assert!(set.has_input());
        assert!(!set.has_output());

        set |= EventSet::WRITABLE;
        assert!(set.has_output());

        set = set.without(EventSet::READABLE);
        assert!(!set.has_input());
        assert!(set.has_output());

        set = set.without(EventSet::WRITABLE);
        assert!(set.is_empty());
    }

    #[test]
    fn poll_round_trip() {
        let set = EventSet::READABLE | EventSet::WRITABLE;
        assert_eq!(EventSet::from_poll(set.to_poll()), set);
        assert_eq!(EventSet::from_epoll(set.to_epoll()), set);
    }

    #[test]
    fn reported_bits() {
        let revents = EventSet::from_poll(libc::POLLHUP | libc::POLLERR);
        assert!(revents.has_hangup());
        assert!(revents.has_error());
        assert!(!revents.has_input());
        assert_eq!(format!("{:?}", revents), "ERR | HUP");
    }
}
