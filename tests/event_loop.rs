use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use muxio::{EventLoop, EventLoopThread, EventLoopThreadPool};

mod util;

#[test]
fn one_loop_per_thread() {
    util::init();
    thread::spawn(|| {
        let _event_loop = EventLoop::new().unwrap();
        let second = panic::catch_unwind(AssertUnwindSafe(EventLoop::new));
        assert!(second.is_err());
    })
    .join()
    .unwrap();
}

#[test]
fn current_loop_sentinel() {
    util::init();
    thread::spawn(|| {
        assert!(EventLoop::current().is_none());
        let event_loop = EventLoop::new().unwrap();
        assert!(EventLoop::current().is_some());
        drop(event_loop);
        assert!(EventLoop::current().is_none());
    })
    .join()
    .unwrap();
}

#[test]
fn cross_thread_task_runs() {
    util::init();
    let mut loop_thread = EventLoopThread::new("task".to_string(), None);
    let handle = loop_thread.start_loop();

    let (tx, rx) = mpsc::channel();
    handle.run_in_loop(move || {
        let event_loop = EventLoop::current().unwrap();
        assert!(event_loop.is_in_loop_thread());
        tx.send(thread::current().id()).unwrap();
    });
    let loop_thread_id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(loop_thread_id, thread::current().id());
}

#[test]
fn foreign_tasks_run_in_fifo_order() {
    util::init();
    let mut loop_thread = EventLoopThread::new("fifo".to_string(), None);
    let handle = loop_thread.start_loop();

    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..100 {
        let order = Arc::clone(&order);
        let done = Arc::clone(&done);
        handle.queue_in_loop(move || {
            order.lock().unwrap().push(i);
            done.fetch_add(1, Ordering::AcqRel);
        });
    }
    util::wait_for_count(&done, 100);
    assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn queued_task_defers_but_runs() {
    util::init();
    let mut loop_thread = EventLoopThread::new("defer".to_string(), None);
    let handle = loop_thread.start_loop();

    let done = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&done);
    handle.run_in_loop(move || {
        let event_loop = EventLoop::current().unwrap();
        let done = Arc::clone(&observed);
        // Queued from the loop thread: must not run synchronously.
        event_loop.queue_in_loop(move || {
            done.fetch_add(1, Ordering::AcqRel);
        });
        assert_eq!(observed.load(Ordering::Acquire), 0);
    });
    util::wait_for_count(&done, 1);
}

#[test]
fn quit_stops_the_loop() {
    util::init();
    let (tx, rx) = mpsc::channel();
    let joined = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let handle = rx.recv().unwrap();
    handle.quit();
    joined.join().unwrap();
}

#[test]
fn iteration_counts_wakeups() {
    util::init();
    let (tx, rx) = mpsc::channel();
    let joined = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
        assert!(event_loop.iteration() >= 1);
    });
    let handle = rx.recv().unwrap();
    let (task_tx, task_rx) = mpsc::channel();
    handle.run_in_loop(move || task_tx.send(()).unwrap());
    task_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.quit();
    joined.join().unwrap();
}

#[test]
fn pool_round_robin() {
    util::init();
    thread::spawn(|| {
        let event_loop = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(event_loop.handle(), "pool".to_string());
        pool.set_thread_num(2);
        pool.start(None);

        let first = pool.get_next_loop();
        let second = pool.get_next_loop();
        let third = pool.get_next_loop();
        assert_ne!(first, second);
        assert_eq!(first, third);
        assert_eq!(pool.get_all_loops().len(), 2);

        // Hashed lookup is stable.
        assert_eq!(pool.get_loop_for_hash(7), pool.get_loop_for_hash(7));
    })
    .join()
    .unwrap();
}

#[test]
fn empty_pool_returns_base_loop() {
    util::init();
    thread::spawn(|| {
        let event_loop = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(event_loop.handle(), "pool".to_string());
        let init_ran = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&init_ran);
        pool.start(Some(Arc::new(move |_| {
            observed.fetch_add(1, Ordering::AcqRel);
        })));
        assert_eq!(init_ran.load(Ordering::Acquire), 1);
        assert!(pool.get_next_loop().is_in_loop_thread());
    })
    .join()
    .unwrap();
}

#[test]
fn thread_init_runs_on_each_loop() {
    util::init();
    thread::spawn(|| {
        let event_loop = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(event_loop.handle(), "init".to_string());
        pool.set_thread_num(3);
        let init_ran = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&init_ran);
        pool.start(Some(Arc::new(move |event_loop| {
            assert!(event_loop.is_in_loop_thread());
            observed.fetch_add(1, Ordering::AcqRel);
        })));
        assert_eq!(init_ran.load(Ordering::Acquire), 3);
    })
    .join()
    .unwrap();
}
