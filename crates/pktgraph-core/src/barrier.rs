//! Lifecycle barriers used to serialize initialization across thread tiers.
//!
//! The orchestrator's bring-up ladder interleaves work on the main thread
//! with work that must run on a specific worker thread (for example,
//! offloadable-element init on the coprocessor thread that owns the device
//! command stream). `CountedBarrier` is the rendezvous primitive: one side
//! calls `proceed`, the other blocks in `wait` until the count is reached.

use parking_lot::{Condvar, Mutex};

/// A monotonically counted barrier.
///
/// Unlike `std::sync::Barrier` this is not cyclic: `proceed` may be called
/// from any thread, `wait` returns once `target` proceeds have happened,
/// and late waiters return immediately.
pub struct CountedBarrier {
    count: Mutex<usize>,
    cond: Condvar,
    target: usize,
}

impl CountedBarrier {
    /// Create a barrier that releases waiters after `target` proceeds.
    pub fn new(target: usize) -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
            target,
        }
    }

    /// Record one arrival and wake waiters if the target is reached.
    pub fn proceed(&self) {
        let mut count = self.count.lock();
        *count += 1;
        if *count >= self.target {
            self.cond.notify_all();
        }
    }

    /// Block until `target` arrivals have been recorded.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count < self.target {
            self.cond.wait(&mut count);
        }
    }

    /// Current arrival count (diagnostics only).
    pub fn arrived(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_rendezvous() {
        let barrier = Arc::new(CountedBarrier::new(1));
        let b = Arc::clone(&barrier);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            b.proceed();
        });
        barrier.wait();
        h.join().unwrap();
        assert_eq!(barrier.arrived(), 1);
    }

    #[test]
    fn test_late_waiter_returns_immediately() {
        let barrier = CountedBarrier::new(2);
        barrier.proceed();
        barrier.proceed();
        barrier.wait();
    }

    #[test]
    fn test_many_proceeders() {
        let barrier = Arc::new(CountedBarrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let b = Arc::clone(&barrier);
            handles.push(thread::spawn(move || b.proceed()));
        }
        barrier.wait();
        for h in handles {
            h.join().unwrap();
        }
    }
}
