use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::{EventFd, TimerFd};
use crate::timer::{Timer, TimerId, TimerQueue};

/// How long one poll may block when nothing is pending.
const POLL_TIME: Duration = Duration::from_secs(10);

thread_local! {
    /// The loop owned by the current thread, if any. One loop per thread.
    static CURRENT_LOOP: RefCell<Weak<LoopInner>> = RefCell::new(Weak::new());
}

/// Process-wide one-time setup. Writing to a peer that went away must
/// surface as `EPIPE` from write(2), not kill the process.
fn global_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        trace!("ignoring SIGPIPE");
    });
}

type Task = Box<dyn FnOnce() + Send>;
type LocalTask = Box<dyn FnOnce()>;

/// A per-thread reactor.
///
/// `EventLoop` drives a [`Poller`], dispatches readiness to registered
/// [`Channel`]s, runs expired timers and executes tasks posted from other
/// threads. It is not `Send`: the value is pinned to the thread that
/// created it, and at most one loop may exist per thread.
///
/// Cross-thread interaction goes through [`LoopHandle`], obtained from
/// [`handle`]. A handle can post closures, schedule and cancel timers, and
/// ask the loop to quit; a dedicated eventfd wakes the loop out of a
/// blocking poll whenever something is posted from outside.
///
/// # Examples
///
/// ```no_run
/// use muxio::EventLoop;
/// use std::time::Duration;
///
/// let event_loop = EventLoop::new().unwrap();
/// let handle = event_loop.handle();
/// event_loop.run_after(Duration::from_secs(1), move || handle.quit());
/// event_loop.run();
/// ```
///
/// [`handle`]: EventLoop::handle
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

/// The `Send + Sync` face of an [`EventLoop`].
///
/// Handles stay valid after their loop is gone; tasks posted to a dead
/// loop are silently dropped with it.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

/// State reachable from foreign threads.
pub(crate) struct LoopShared {
    thread: ThreadId,
    quit: AtomicBool,
    wakeup_fd: EventFd,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
}

pub(crate) struct LoopInner {
    shared: Arc<LoopShared>,
    poller: RefCell<Poller>,
    timers: TimerQueue,
    wakeup_channel: Rc<Channel>,
    active_channels: RefCell<Vec<Rc<Channel>>>,
    current_active: RefCell<Option<Rc<Channel>>>,
    local_pending: RefCell<Vec<LocalTask>>,
    looping: Cell<bool>,
    event_handling: Cell<bool>,
    iteration: Cell<u64>,
}

impl EventLoop {
    /// Creates the loop for the current thread.
    ///
    /// Fails if the kernel objects (multiplexer, eventfd, timerfd) cannot
    /// be created. Panics if this thread already owns a loop.
    pub fn new() -> io::Result<EventLoop> {
        global_init();
        CURRENT_LOOP.with(|current| {
            if current.borrow().upgrade().is_some() {
                panic!(
                    "another EventLoop already exists on thread {:?}",
                    thread::current().id()
                );
            }
        });

        let poller = Poller::new()?;
        let wakeup_fd = EventFd::new()?;
        let timer_fd = TimerFd::new()?;
        let timer_fd_raw = timer_fd.as_raw_fd();
        let shared = Arc::new(LoopShared {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            wakeup_fd,
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
        });

        let inner = Rc::new_cyclic(|weak: &Weak<LoopInner>| {
            let wakeup_channel = Channel::with_loop(weak.clone(), shared.wakeup_fd.as_raw_fd());
            let timer_channel = Channel::with_loop(weak.clone(), timer_fd_raw);
            LoopInner {
                shared: Arc::clone(&shared),
                poller: RefCell::new(poller),
                timers: TimerQueue::new(timer_fd, timer_channel),
                wakeup_channel,
                active_channels: RefCell::new(Vec::new()),
                current_active: RefCell::new(None),
                local_pending: RefCell::new(Vec::new()),
                looping: Cell::new(false),
                event_handling: Cell::new(false),
                iteration: Cell::new(0),
            }
        });

        // The service channels can only register once the Rc exists, since
        // registration goes through the loop's weak back-reference.
        let drain_shared = Arc::clone(&shared);
        inner
            .wakeup_channel
            .set_read_callback(move |_| drain_shared.wakeup_fd.drain());
        inner.wakeup_channel.enable_reading();

        let weak = Rc::downgrade(&inner);
        inner.timers.channel().set_read_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.timers.handle_read();
            }
        });
        inner.timers.channel().enable_reading();

        CURRENT_LOOP.with(|current| *current.borrow_mut() = Rc::downgrade(&inner));
        debug!("EventLoop created on thread {:?}", shared.thread);
        Ok(EventLoop { inner })
    }

    /// The loop owned by the calling thread, if one exists.
    pub fn current() -> Option<EventLoop> {
        CURRENT_LOOP.with(|current| current.borrow().upgrade().map(EventLoop::from_inner))
    }

    pub(crate) fn from_inner(inner: Rc<LoopInner>) -> EventLoop {
        EventLoop { inner }
    }

    pub(crate) fn downgrade_inner(&self) -> Weak<LoopInner> {
        Rc::downgrade(&self.inner)
    }

    /// A cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Runs the loop until [`quit`] is asked for.
    ///
    /// Each iteration waits on the poller, dispatches the channels that
    /// came back ready in kernel order, then runs the posted tasks.
    ///
    /// [`quit`]: LoopHandle::quit
    pub fn run(&self) {
        let inner = &*self.inner;
        assert!(!inner.looping.get(), "loop is already running");
        self.assert_in_loop_thread();
        inner.looping.set(true);
        inner.shared.quit.store(false, Ordering::Release);
        trace!("EventLoop start looping");

        while !inner.shared.quit.load(Ordering::Acquire) {
            inner.active_channels.borrow_mut().clear();
            let receive_time = inner
                .poller
                .borrow_mut()
                .poll(POLL_TIME, &mut inner.active_channels.borrow_mut());
            inner.iteration.set(inner.iteration.get() + 1);

            inner.event_handling.set(true);
            let active = inner.active_channels.borrow().clone();
            for channel in &active {
                *inner.current_active.borrow_mut() = Some(Rc::clone(channel));
                channel.handle_event(receive_time);
            }
            *inner.current_active.borrow_mut() = None;
            inner.event_handling.set(false);

            inner.do_pending_tasks();
        }

        // One last drain so teardown work posted in the final iteration
        // (connection destruction, channel removal) still runs; anything
        // queued from now on is dropped with the loop.
        inner.do_pending_tasks();

        trace!("EventLoop stop looping");
        inner.looping.set(false);
    }

    /// Asks the loop to exit once the current iteration finishes.
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Runs `task` immediately. Present for symmetry with
    /// [`LoopHandle::run_in_loop`]; on the owning thread the call is
    /// synchronous by definition.
    pub fn run_in_loop(&self, task: impl FnOnce() + 'static) {
        task();
    }

    /// Defers `task` to the task phase of a later iteration, even when
    /// called from the loop thread itself. Unlike the handle equivalent
    /// the closure may be `!Send`.
    pub fn queue_in_loop(&self, task: impl FnOnce() + 'static) {
        self.inner.local_pending.borrow_mut().push(Box::new(task));
        // A task queued while the pending batch is being drained would
        // otherwise sit until the next I/O event wakes the loop.
        if self.inner.shared.calling_pending.load(Ordering::Acquire) {
            self.inner.shared.wakeup_fd.wake();
        }
    }

    /// Schedules `callback` at `when`.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + 'static) -> TimerId {
        let id = TimerId::next();
        self.inner
            .timers
            .add_timer_in_loop(Timer::new(Box::new(callback), when, None, id));
        id
    }

    /// Schedules `callback` after `delay`.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Schedules `callback` every `interval`, first firing one interval
    /// from now.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + 'static) -> TimerId {
        let id = TimerId::next();
        self.inner.timers.add_timer_in_loop(Timer::new(
            Box::new(callback),
            Instant::now() + interval,
            Some(interval),
            id,
        ));
        id
    }

    /// Cancels a timer. Best effort: a timer already dispatching fires
    /// this one last time, but a repeat will not re-arm.
    pub fn cancel(&self, id: TimerId) {
        self.inner.timers.cancel_in_loop(id);
    }

    /// Number of completed poll iterations.
    pub fn iteration(&self) -> u64 {
        self.inner.iteration.get()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.shared.thread
    }

    pub fn assert_in_loop_thread(&self) {
        self.handle().assert_in_loop_thread();
    }

    /// Synchronises `channel`'s interest with the poller. Owning thread
    /// only; normally called through the channel's own mutators.
    pub fn update_channel(&self, channel: &Rc<Channel>) {
        self.inner.update_channel(channel);
    }

    /// Unregisters `channel` from the poller. Owning thread only.
    pub fn remove_channel(&self, channel: &Rc<Channel>) {
        self.inner.remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.inner.has_channel(channel)
    }
}

impl LoopInner {
    fn assert_in_loop_thread(&self) {
        let current = thread::current().id();
        assert!(
            current == self.shared.thread,
            "EventLoop accessed off its thread: owner {:?}, current {:?}",
            self.shared.thread,
            current
        );
    }

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        if self.event_handling.get() {
            // Removing a channel mid-dispatch is only sound for the channel
            // being dispatched, or one that is not in the remaining batch.
            let is_current = self
                .current_active
                .borrow()
                .as_ref()
                .is_some_and(|current| Rc::ptr_eq(current, channel));
            assert!(
                is_current
                    || !self
                        .active_channels
                        .borrow()
                        .iter()
                        .any(|active| Rc::ptr_eq(active, channel))
            );
        }
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    fn do_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        // Swap both queues out before running anything: the critical
        // section stays short, and a task that re-enqueues lands in the
        // next iteration instead of livelocking this one.
        let local = self.local_pending.take();
        let foreign = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in local {
            task();
        }
        for task in foreign {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        debug!("EventLoop on thread {:?} destructs", self.shared.thread);
        {
            let mut poller = self.poller.borrow_mut();
            self.wakeup_channel.clear_for_loop_drop();
            poller.remove_channel(&self.wakeup_channel);
            self.timers.detach(&mut poller);
        }
        let _ = CURRENT_LOOP.try_with(|current| *current.borrow_mut() = Weak::new());
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("thread", &self.inner.shared.thread)
            .field("iteration", &self.inner.iteration.get())
            .finish()
    }
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub fn assert_in_loop_thread(&self) {
        let current = thread::current().id();
        assert!(
            current == self.shared.thread,
            "EventLoop accessed off its thread: owner {:?}, current {:?}",
            self.shared.thread,
            current
        );
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.shared.thread
    }

    /// Runs `task` synchronously when called on the loop thread, otherwise
    /// posts it and wakes the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Posts `task` unconditionally; it runs in the task phase of a loop
    /// iteration, in FIFO order relative to other posted tasks.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Number of tasks waiting to run.
    pub fn queue_size(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Asks the loop to exit once the current iteration finishes. Tasks
    /// queued after this may never run. Idempotent.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Schedules `callback` on the loop at `when`.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(when, None, callback)
    }

    /// Schedules `callback` on the loop after `delay`.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Instant::now() + delay, None, callback)
    }

    /// Schedules `callback` on the loop every `interval`.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Instant::now() + interval, Some(interval), callback)
    }

    fn add_timer(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let id = TimerId::next();
        self.run_in_loop(move || {
            let event_loop =
                EventLoop::current().expect("timer posted to a thread without an event loop");
            event_loop
                .inner
                .timers()
                .add_timer_in_loop(Timer::new(Box::new(callback), when, interval, id));
        });
        id
    }

    /// Cancels a timer scheduled on this loop. Safe from any thread.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.inner.timers().cancel_in_loop(id);
            }
        });
    }

    pub(crate) fn wakeup(&self) {
        self.shared.wakeup_fd.wake();
    }
}

impl PartialEq for LoopHandle {
    /// Two handles are equal when they point at the same loop.
    fn eq(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}
