//! Count-down trackers.
//!
//! A tracker is the one blocking primitive the core uses: a counter that
//! callers wait on and completion callbacks signal. It backs request
//! completion, progress-thread start/stop handshakes and drain loops.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct Tracker {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Tracker {
    pub fn new(count: usize) -> Self {
        Tracker {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    /// Decrement the counter, waking waiters when it reaches zero.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cv.wait(&mut count);
        }
    }

    /// Block until the counter reaches zero or `timeout` elapses.
    /// Returns true if the counter reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return true;
        }
        self.cv.wait_for(&mut count, timeout);
        *count == 0
    }

    pub fn is_signalled(&self) -> bool {
        *self.count.lock() == 0
    }

    pub fn remaining(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn signal_releases_waiter() {
        let t = Arc::new(Tracker::new(2));
        let t2 = t.clone();
        let waiter = std::thread::spawn(move || t2.wait());
        t.signal();
        assert!(!t.is_signalled());
        t.signal();
        waiter.join().unwrap();
        assert!(t.is_signalled());
    }

    #[test]
    fn timeout_expires() {
        let t = Tracker::new(1);
        assert!(!t.wait_timeout(Duration::from_millis(10)));
        t.signal();
        assert!(t.wait_timeout(Duration::from_millis(10)));
    }
}
