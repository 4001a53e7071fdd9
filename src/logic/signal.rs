//! Thread Coordination
//!
//! `StopSignal` lets background loops sleep until their next tick or until
//! shutdown, whichever comes first. `WaitGroup` tracks running workers so
//! callers can block until they drain.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

// ============================================================================
// STOP SIGNAL
// ============================================================================

#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `timeout`; returns true if stopped meanwhile
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

// ============================================================================
// WAIT GROUP
// ============================================================================

#[derive(Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    pub fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Wait at most `timeout`; returns true if everything finished
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_stop_signal_interrupts_sleep() {
        let signal = Arc::new(StopSignal::new());
        assert!(!signal.sleep(Duration::from_millis(10)));

        let stopper = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                signal.stop();
            })
        };

        let start = Instant::now();
        assert!(signal.sleep(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        stopper.join().unwrap();
        assert!(signal.is_stopped());
    }

    #[test]
    fn test_wait_group_timeout() {
        let wg = Arc::new(WaitGroup::new());
        assert!(wg.wait_timeout(Duration::from_millis(1)));

        wg.add(1);
        assert!(!wg.wait_timeout(Duration::from_millis(20)));

        let worker = {
            let wg = wg.clone();
            thread::spawn(move || wg.done())
        };
        wg.wait();
        worker.join().unwrap();
        assert!(wg.wait_timeout(Duration::from_millis(1)));
    }
}
