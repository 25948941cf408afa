use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::mem;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::TimerFd;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a scheduled timer, used to cancel it.
///
/// Sequence numbers are allocated from a global counter and never reused,
/// so a stale `TimerId` can at worst cancel nothing.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn next() -> TimerId {
        TimerId(NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }

    fn sequence(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "TimerId({})", self.0)
    }
}

pub(crate) struct Timer {
    callback: Box<dyn FnMut()>,
    expiration: Instant,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(
        callback: Box<dyn FnMut()>,
        expiration: Instant,
        interval: Option<Duration>,
        id: TimerId,
    ) -> Timer {
        Timer {
            callback,
            expiration,
            interval,
            sequence: id.sequence(),
        }
    }

    fn restart(&mut self, now: Instant) {
        // Repeating timers re-arm relative to the dispatch time, not the
        // nominal expiration, matching the kernel timer they ride on.
        self.expiration = now + self.interval.expect("restarting a one-shot timer");
    }
}

/// Per-loop schedule of pending timer callbacks.
///
/// All timers of a loop ride a single `timerfd` registered with the loop's
/// poller, which keeps timer readiness and I/O readiness unified in one
/// wait. The queue is ordered by `(expiration, sequence)`; the descriptor
/// is always armed for the earliest pending expiration.
///
/// Mutation happens only on the owning loop's thread. The thread-safe
/// entry points live on `EventLoop` and `LoopHandle`, which forward here by
/// posting to the loop.
pub(crate) struct TimerQueue {
    timer_fd: TimerFd,
    channel: Rc<Channel>,
    /// Pending timers keyed by expiration, ties broken by sequence.
    timers: RefCell<BTreeMap<(Instant, u64), Timer>>,
    /// Sequence to current expiration, for cancellation lookup.
    active: RefCell<HashMap<u64, Instant>>,
    /// Timers cancelled from inside their own callback; consulted before
    /// re-arming repeats.
    cancelling: RefCell<HashSet<u64>>,
    calling_expired: Cell<bool>,
}

impl TimerQueue {
    pub(crate) fn new(timer_fd: TimerFd, channel: Rc<Channel>) -> TimerQueue {
        TimerQueue {
            timer_fd,
            channel,
            timers: RefCell::new(BTreeMap::new()),
            active: RefCell::new(HashMap::new()),
            cancelling: RefCell::new(HashSet::new()),
            calling_expired: Cell::new(false),
        }
    }

    pub(crate) fn channel(&self) -> &Rc<Channel> {
        &self.channel
    }

    pub(crate) fn add_timer_in_loop(&self, timer: Timer) {
        let expiration = timer.expiration;
        if self.insert(timer) {
            self.timer_fd.arm(expiration);
        }
    }

    pub(crate) fn cancel_in_loop(&self, id: TimerId) {
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        if let Some(expiration) = active.remove(&id.sequence()) {
            let removed = timers.remove(&(expiration, id.sequence()));
            assert!(removed.is_some());
        } else if self.calling_expired.get() {
            // Already fired in this dispatch round; make sure a repeat
            // does not come back.
            self.cancelling.borrow_mut().insert(id.sequence());
        }
        assert_eq!(timers.len(), active.len());
    }

    /// Readable event on the timer descriptor: drain it, run everything
    /// that has expired, re-arm repeats.
    pub(crate) fn handle_read(&self) {
        let now = Instant::now();
        self.timer_fd.drain();

        let mut expired = self.take_expired(now);

        self.calling_expired.set(true);
        self.cancelling.borrow_mut().clear();
        // Callbacks run with no internal borrow held, so they are free to
        // add and cancel timers.
        for timer in expired.iter_mut() {
            (timer.callback)();
        }
        self.calling_expired.set(false);

        self.reset(expired, now);
    }

    fn take_expired(&self, now: Instant) -> Vec<Timer> {
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        // Split at the sentinel (now, u64::MAX): everything strictly below
        // it has expiration <= now.
        let remaining = timers.split_off(&(now, u64::MAX));
        let expired = mem::replace(&mut *timers, remaining);
        for (_, sequence) in expired.keys() {
            let removed = active.remove(sequence);
            assert!(removed.is_some());
        }
        assert_eq!(timers.len(), active.len());
        expired.into_values().collect()
    }

    fn reset(&self, expired: Vec<Timer>, now: Instant) {
        for mut timer in expired {
            let cancelled = self.cancelling.borrow().contains(&timer.sequence);
            if timer.interval.is_some() && !cancelled {
                timer.restart(now);
                self.insert(timer);
            }
        }
        let next_expiration = self.timers.borrow().keys().next().map(|&(when, _)| when);
        if let Some(when) = next_expiration {
            self.timer_fd.arm(when);
        }
    }

    /// Returns true when the new timer expires before every pending one,
    /// meaning the kernel timer must be re-armed.
    fn insert(&self, timer: Timer) -> bool {
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        let earliest_changed = match timers.keys().next() {
            Some(&(first, _)) => timer.expiration < first,
            None => true,
        };
        let previous = active.insert(timer.sequence, timer.expiration);
        assert!(previous.is_none());
        let previous = timers.insert((timer.expiration, timer.sequence), timer);
        assert!(previous.is_none());
        assert_eq!(timers.len(), active.len());
        earliest_changed
    }

    /// Teardown path used while the owning loop is being dropped.
    pub(crate) fn detach(&self, poller: &mut Poller) {
        self.channel.clear_for_loop_drop();
        poller.remove_channel(&self.channel);
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TimerQueue")
            .field("pending", &self.timers.borrow().len())
            .finish()
    }
}
