use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, trace};

use crate::event_loop::{EventLoop, LoopHandle};

/// Run once inside each freshly spawned loop thread, before the loop
/// starts, with the loop that thread owns.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// A thread whose sole job is running one event loop.
///
/// The loop is constructed on the spawned thread's stack and its handle is
/// published back through a condition variable, so [`start_loop`] returns
/// only once the loop is ready to receive work. Dropping the value asks
/// the loop to quit and joins the thread.
///
/// [`start_loop`]: EventLoopThread::start_loop
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    thread: Option<thread::JoinHandle<()>>,
    loop_handle: Option<LoopHandle>,
}

impl EventLoopThread {
    pub fn new(name: String, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name,
            init,
            thread: None,
            loop_handle: None,
        }
    }

    /// Spawns the thread and blocks until its loop is running, returning
    /// the loop's handle.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread already started");
        let ready = Arc::new((Mutex::new(None::<LoopHandle>), Condvar::new()));
        let publish = Arc::clone(&ready);
        let init = self.init.take();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                // Fatal by design: a loop thread without a loop is useless.
                let event_loop = EventLoop::new().expect("failed to create event loop");
                if let Some(init) = init {
                    init(&event_loop);
                }
                {
                    let (slot, ready) = &*publish;
                    *slot.lock().unwrap() = Some(event_loop.handle());
                    ready.notify_one();
                }
                event_loop.run();
                trace!("event loop thread exiting");
            })
            .expect("failed to spawn event loop thread");
        self.thread = Some(thread);

        let (slot, ready) = &*ready;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = ready.wait(guard).unwrap();
        }
        let handle = guard.clone().unwrap();
        drop(guard);
        self.loop_handle = Some(handle.clone());
        handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = &self.loop_handle {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for EventLoopThread {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EventLoopThread")
            .field("name", &self.name)
            .field("started", &self.thread.is_some())
            .finish()
    }
}

/// One acceptor loop plus a pool of I/O loops.
///
/// With zero threads every connection shares the base loop and the pool
/// degenerates to single-threaded operation. Otherwise [`get_next_loop`]
/// deals out the spawned loops round-robin.
///
/// [`get_next_loop`]: EventLoopThreadPool::get_next_loop
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: String) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name,
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started, "thread pool already started");
        self.base.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let mut thread =
                EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }
        debug!("pool [{}] started {} loop(s)", self.name, self.num_threads);
        if self.num_threads == 0 {
            if let Some(init) = init {
                let event_loop =
                    EventLoop::current().expect("pool started outside its base loop thread");
                init(&event_loop);
            }
        }
    }

    /// The loop the next connection should land on: round-robin over the
    /// pool, or the base loop when the pool is empty.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        assert!(self.started);
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let handle = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        handle
    }

    /// Deterministic loop selection: the same hash always lands on the
    /// same loop.
    pub fn get_loop_for_hash(&self, hash: usize) -> LoopHandle {
        self.base.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base.clone();
        }
        self.loops[hash % self.loops.len()].clone()
    }

    pub fn get_all_loops(&self) -> Vec<LoopHandle> {
        self.base.assert_in_loop_thread();
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }
}

impl fmt::Debug for EventLoopThreadPool {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EventLoopThreadPool")
            .field("name", &self.name)
            .field("threads", &self.num_threads)
            .field("started", &self.started)
            .finish()
    }
}
