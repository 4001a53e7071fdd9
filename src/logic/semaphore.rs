//! Counting Semaphore
//!
//! Caps concurrent hook side jobs (dumps) independently of the engine lock.

use parking_lot::{Condvar, Mutex};

pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

/// Permit released on drop
pub struct Permit<'a> {
    sem: &'a Semaphore,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available
    pub fn acquire(&self) -> Permit<'_> {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
        Permit { sem: self }
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.cond.notify_one();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_permits_are_bounded() {
        let sem = Semaphore::new(2);
        let a = sem.acquire();
        let _b = sem.acquire();
        assert_eq!(sem.available(), 0);
        drop(a);
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(1));
        let permit = sem.acquire();

        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || {
                let _p = sem.acquire();
            })
        };

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(permit);
        waiter.join().unwrap();
        assert_eq!(sem.available(), 1);
    }
}
