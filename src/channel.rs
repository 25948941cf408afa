use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Weak as ArcWeak;
use std::time::Instant;

use log::{trace, warn};

use crate::event::EventSet;
use crate::event_loop::{EventLoop, LoopInner};

/// Index states shared with the poller backends. `NEW` doubles as the
/// "no pollfd slot" marker for the poll(2) backend.
pub(crate) const INDEX_NEW: i32 = -1;

pub(crate) type ReadCallback = Box<dyn FnMut(Instant)>;
pub(crate) type EventCallback = Box<dyn FnMut()>;

/// The binding of one file descriptor to one event loop.
///
/// A `Channel` owns the interest set and the per-event callbacks for a
/// descriptor it does not own. It is created disabled; enabling an event
/// registers the descriptor with the loop's poller, and every interest
/// mutation is synchronised to the kernel immediately. All methods must be
/// called from the owning loop's thread.
///
/// Higher-level owners (a connection, for instance) call [`tie`] with a
/// weak reference to themselves. During [`handle_event`] the weak reference
/// is upgraded and held for the duration of the dispatch, so callbacks may
/// drop the last external strong reference to the owner without pulling the
/// rug out from under their own stack frame. If the upgrade fails the event
/// is dropped: the tied object is already gone.
///
/// [`tie`]: Channel::tie
/// [`handle_event`]: Channel::handle_event
pub struct Channel {
    owner: Weak<LoopInner>,
    self_weak: Weak<Channel>,
    fd: RawFd,
    events: Cell<EventSet>,
    revents: Cell<EventSet>,
    index: Cell<i32>,
    tie: RefCell<Option<ArcWeak<dyn Any + Send + Sync>>>,
    tied: Cell<bool>,
    event_handling: Cell<bool>,
    added_to_loop: Cell<bool>,
    read_callback: RefCell<Option<ReadCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
}

impl Channel {
    /// Creates a disabled channel for `fd` on `event_loop`.
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> Rc<Channel> {
        Channel::with_loop(event_loop.downgrade_inner(), fd)
    }

    pub(crate) fn with_loop(owner: Weak<LoopInner>, fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|self_weak| Channel {
            owner,
            self_weak: self_weak.clone(),
            fd,
            events: Cell::new(EventSet::NONE),
            revents: Cell::new(EventSet::NONE),
            index: Cell::new(INDEX_NEW),
            tie: RefCell::new(None),
            tied: Cell::new(false),
            event_handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> EventSet {
        self.events.get()
    }

    pub fn revents(&self) -> EventSet {
        self.revents.get()
    }

    pub(crate) fn set_revents(&self, revents: EventSet) {
        self.revents.set(revents);
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.get()
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.set(index);
    }

    /// The loop this channel belongs to. Panics if the loop is gone.
    pub fn owner_loop(&self) -> EventLoop {
        EventLoop::from_inner(
            self.owner
                .upgrade()
                .expect("channel outlived its event loop"),
        )
    }

    pub fn set_read_callback(&self, callback: impl FnMut(Instant) + 'static) {
        *self.read_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl FnMut() + 'static) {
        *self.write_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_close_callback(&self, callback: impl FnMut() + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl FnMut() + 'static) {
        *self.error_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Ties this channel to the object owning it, typically the connection
    /// whose socket this channel watches.
    pub fn tie(&self, owner: ArcWeak<dyn Any + Send + Sync>) {
        *self.tie.borrow_mut() = Some(owner);
        self.tied.set(true);
    }

    pub fn is_none_event(&self) -> bool {
        self.events.get().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.events.get().intersects(EventSet::READABLE)
    }

    pub fn is_writing(&self) -> bool {
        self.events.get().intersects(EventSet::WRITABLE)
    }

    pub fn enable_reading(&self) {
        self.events.set(self.events.get() | EventSet::READABLE);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.events.set(self.events.get().without(EventSet::READABLE));
        self.update();
    }

    pub fn enable_writing(&self) {
        self.events.set(self.events.get() | EventSet::WRITABLE);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.events.set(self.events.get().without(EventSet::WRITABLE));
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.set(EventSet::NONE);
        self.update();
    }

    /// Unregisters the channel from its loop. The interest set must already
    /// be empty.
    pub fn remove(&self) {
        assert!(self.is_none_event());
        self.added_to_loop.set(false);
        let this = self.self_weak.upgrade().expect("channel already dropped");
        self.owner
            .upgrade()
            .expect("channel outlived its event loop")
            .remove_channel(&this);
    }

    fn update(&self) {
        self.added_to_loop.set(true);
        let this = self.self_weak.upgrade().expect("channel already dropped");
        self.owner
            .upgrade()
            .expect("channel outlived its event loop")
            .update_channel(&this);
    }

    /// Interest reset used while the loop itself is being torn down, when
    /// the usual weak back-reference can no longer be upgraded.
    pub(crate) fn clear_for_loop_drop(&self) {
        self.events.set(EventSet::NONE);
        self.added_to_loop.set(false);
    }

    /// Dispatches the events reported by the poller, in a fixed order:
    /// hang-up without input fires the close callback, error and invalid
    /// descriptor fire the error callback, any input fires the read
    /// callback, output readiness fires the write callback.
    pub fn handle_event(&self, receive_time: Instant) {
        if self.tied.get() {
            let guard = self.tie.borrow().as_ref().and_then(ArcWeak::upgrade);
            match guard {
                Some(_guard) => self.handle_event_with_guard(receive_time),
                // The tied owner is gone; the event outlived it.
                None => trace!("channel fd={} dropped event for dead owner", self.fd),
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        self.event_handling.set(true);
        let revents = self.revents.get();
        trace!("channel fd={} handling {{{:?}}}", self.fd, revents);

        if revents.has_hangup() && !revents.contains(EventSet::IN) {
            warn!("channel fd={} POLLHUP", self.fd);
            if let Some(callback) = self.close_callback.borrow_mut().as_mut() {
                callback();
            }
        }
        if revents.has_invalid() {
            warn!("channel fd={} POLLNVAL", self.fd);
        }
        if revents.has_error() || revents.has_invalid() {
            if let Some(callback) = self.error_callback.borrow_mut().as_mut() {
                callback();
            }
        }
        if revents.has_input() {
            if let Some(callback) = self.read_callback.borrow_mut().as_mut() {
                callback(receive_time);
            }
        }
        if revents.has_output() {
            if let Some(callback) = self.write_callback.borrow_mut().as_mut() {
                callback();
            }
        }
        self.event_handling.set(false);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        assert!(!self.event_handling.get());
        // Still attached is a defect, unless the whole loop is already
        // gone and took the kernel registration with it.
        assert!(!self.added_to_loop.get() || self.owner.strong_count() == 0);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events.get())
            .field("revents", &self.revents.get())
            .finish()
    }
}
