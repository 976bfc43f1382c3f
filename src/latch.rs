//! Countdown latch used for the startup barrier and cooperative stop.

use std::sync::{Condvar, Mutex};

/// A countdown synchronization primitive.
///
/// Created with a count `n >= 0`. Workers decrement the count with
/// [`count_down`](Self::count_down); decrementing below zero is a no-op, so
/// over-calling never errors. [`wait`](Self::wait) blocks until the count
/// reaches zero and returns immediately if it already has.
///
/// There is no cancellation: a permanently stuck `wait` is the caller's
/// timeout concern, not the latch's.
#[derive(Debug)]
pub struct CountdownLatch {
    count: Mutex<u64>,
    zeroed: Condvar,
}

impl CountdownLatch {
    /// Creates a latch with the given initial count.
    #[must_use]
    pub const fn new(count: u64) -> Self {
        Self {
            count: Mutex::new(count),
            zeroed: Condvar::new(),
        }
    }

    /// Decrements the count by one, saturating at zero.
    ///
    /// Safe to call from any number of threads concurrently. The call that
    /// brings the count to zero wakes every waiter.
    pub fn count_down(&self) {
        let mut count = self.count.lock().expect("lock poisoned");
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.zeroed.notify_all();
        }
    }

    /// Blocks the calling thread until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("lock poisoned");
        while *count > 0 {
            count = self.zeroed.wait(count).expect("lock poisoned");
        }
    }

    /// Returns the current count.
    #[must_use]
    pub fn count(&self) -> u64 {
        *self.count.lock().expect("lock poisoned")
    }

    /// Returns true if the count has reached zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.count() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_new_latch_count() {
        let latch = CountdownLatch::new(3);
        assert_eq!(latch.count(), 3);
        assert!(!latch.is_zero());
    }

    #[test]
    fn test_count_down_to_zero() {
        let latch = CountdownLatch::new(2);
        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();
        assert!(latch.is_zero());
    }

    #[test]
    fn test_over_count_down_is_noop() {
        let latch = CountdownLatch::new(1);
        latch.count_down();
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_wait_returns_when_already_zero() {
        let latch = CountdownLatch::new(0);
        latch.wait();
    }

    #[test]
    fn test_concurrent_count_down() {
        let latch = Arc::new(CountdownLatch::new(3));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.count_down())
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert!(latch.is_zero());
        // A fourth count_down after zero stays a no-op.
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_wait_blocks_until_zero() {
        let latch = Arc::new(CountdownLatch::new(2));

        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                latch.wait();
                latch.count()
            })
        };

        latch.count_down();
        latch.count_down();

        assert_eq!(waiter.join().expect("thread panicked"), 0);
    }
}
