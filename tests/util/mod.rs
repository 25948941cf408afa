// Not every helper is used by every test binary.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Spins until `condition` holds or five seconds pass.
pub fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Spins until `counter` reaches at least `target`.
pub fn wait_for_count(counter: &AtomicUsize, target: usize) {
    wait_for(|| counter.load(Ordering::Acquire) >= target);
}
