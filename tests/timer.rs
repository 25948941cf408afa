use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use muxio::{EventLoop, EventLoopThread, TimerId};

mod util;

#[test]
fn timers_fire_in_expiration_order() {
    util::init();
    let order = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&order);
    thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let record = |name: &'static str| {
            let order = Arc::clone(&observed);
            let handle = handle.clone();
            move || {
                let mut order = order.lock().unwrap();
                order.push(name);
                if order.len() == 3 {
                    handle.quit();
                }
            }
        };
        // Scheduled shortest-last; must fire shortest-first.
        event_loop.run_after(Duration::from_millis(60), record("c"));
        event_loop.run_after(Duration::from_millis(20), record("a"));
        event_loop.run_after(Duration::from_millis(40), record("b"));
        event_loop.run();
    })
    .join()
    .unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
}

#[test]
fn run_at_fires_close_to_deadline() {
    util::init();
    let mut loop_thread = EventLoopThread::new("run-at".to_string(), None);
    let handle = loop_thread.start_loop();

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&fired);
    let start = Instant::now();
    handle.run_at(start + Duration::from_millis(50), move || {
        observed.fetch_add(1, Ordering::AcqRel);
    });
    util::wait_for_count(&fired, 1);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "fired early: {:?}", elapsed);
}

#[test]
fn repeating_timer_repeats() {
    util::init();
    let mut loop_thread = EventLoopThread::new("every".to_string(), None);
    let handle = loop_thread.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&count);
    handle.run_every(Duration::from_millis(20), move || {
        observed.fetch_add(1, Ordering::AcqRel);
    });
    util::wait_for_count(&count, 3);
}

#[test]
fn cancel_pending_timer() {
    util::init();
    let mut loop_thread = EventLoopThread::new("cancel".to_string(), None);
    let handle = loop_thread.start_loop();

    let fired = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&fired);
    let id = handle.run_after(Duration::from_millis(200), move || {
        observed.store(true, Ordering::Release);
    });
    handle.cancel(id);
    thread::sleep(Duration::from_millis(400));
    assert!(!fired.load(Ordering::Acquire));
}

#[test]
fn cross_thread_cancel_stops_repeats() {
    util::init();
    let mut loop_thread = EventLoopThread::new("xcancel".to_string(), None);
    let handle = loop_thread.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&count);
    let id = handle.run_every(Duration::from_millis(50), move || {
        observed.fetch_add(1, Ordering::AcqRel);
    });

    // Watch two firings from this foreign thread, then cancel.
    util::wait_for_count(&count, 2);
    handle.cancel(id);
    // One in-flight firing may still land.
    let ceiling = count.load(Ordering::Acquire) + 1;
    thread::sleep(Duration::from_millis(300));
    assert!(count.load(Ordering::Acquire) <= ceiling);

    // The loop stays responsive afterwards.
    let alive = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&alive);
    handle.run_in_loop(move || observed.store(true, Ordering::Release));
    util::wait_for(|| alive.load(Ordering::Acquire));
}

#[test]
fn timer_cancelling_itself_stops() {
    util::init();
    let mut loop_thread = EventLoopThread::new("self-cancel".to_string(), None);
    let handle = loop_thread.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let own_id: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let observed = Arc::clone(&count);
    let id_slot = Arc::clone(&own_id);
    let cancel_handle = handle.clone();
    let id = handle.run_every(Duration::from_millis(30), move || {
        observed.fetch_add(1, Ordering::AcqRel);
        // Cancel from inside the firing callback: the repeat must not
        // re-arm.
        if let Some(id) = *id_slot.lock().unwrap() {
            cancel_handle.cancel(id);
        }
    });
    *own_id.lock().unwrap() = Some(id);

    util::wait_for_count(&count, 1);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::Acquire), 1);
}
