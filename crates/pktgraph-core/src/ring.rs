//! Bounded rings with high-water marks and edge-triggered wake watchers.
//!
//! Rings are the only cross-thread channel in the steady state: I/O threads
//! feed computation threads (SW-RX), computation threads feed coprocessor
//! threads (task input) and get completions back (task output), and every
//! thread returns dead packets through its I/O thread's drop ring.
//!
//! Enqueue never blocks; a full ring hands the item back through
//! [`RingFull`] and the caller decides what to drop. When occupancy
//! crosses the ring's
//! high-water mark the attached watcher is signaled; the watcher is
//! edge-triggered, so repeated signals coalesce until the consumer drains
//! and re-arms.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Rejected enqueue carrying the item back to the producer, so a full
/// ring never destroys a packet: the caller routes it to a drop ring or
/// falls back to the CPU path.
#[derive(Debug)]
pub struct RingFull<T>(pub T);

impl<T> From<RingFull<T>> for Error {
    fn from(_: RingFull<T>) -> Self {
        Error::RingFull { capacity: 0 }
    }
}

/// Producer role of a ring, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMode {
    /// Exactly one producer thread; enqueue is lock-free.
    Single,
    /// Multiple producer threads; enqueues serialize on a producer lock.
    Multi,
}

/// Counters for one ring.
#[derive(Debug, Clone, Default)]
pub struct RingStats {
    /// Total items enqueued.
    pub enqueued: u64,
    /// Total items dequeued.
    pub dequeued: u64,
    /// Enqueues rejected because the ring was full.
    pub rejected: u64,
    /// Current occupancy.
    pub depth: u64,
    /// Maximum occupancy observed.
    pub max_depth: u64,
}

struct RingStatsInner {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
    max_depth: AtomicU64,
}

/// Bounded ring carrying owned items of type `T`.
///
/// Capacity is rounded up to a power of two. The consumer side is always
/// single-threaded (each ring has exactly one owning consumer context).
pub struct Ring<T> {
    slots: Box<[Mutex<Option<T>>]>,
    capacity: usize,
    mask: usize,
    head: AtomicU64,
    tail: AtomicU64,
    producer_lock: Option<Mutex<()>>,
    high_water: usize,
    above_mark: AtomicBool,
    watcher: OnceLock<Arc<Watcher>>,
    stats: RingStatsInner,
}

impl<T> Ring<T> {
    /// Create a ring. The high-water mark defaults to 3/4 of capacity.
    pub fn new(capacity: usize, mode: ProducerMode) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let high_water = capacity - capacity / 4;
        Self::with_high_water(capacity, mode, high_water)
    }

    /// Create a ring with an explicit high-water mark.
    pub fn with_high_water(capacity: usize, mode: ProducerMode, high_water: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(None));
        }
        Self {
            slots: slots.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            producer_lock: match mode {
                ProducerMode::Single => None,
                ProducerMode::Multi => Some(Mutex::new(())),
            },
            high_water: high_water.min(capacity),
            above_mark: AtomicBool::new(false),
            watcher: OnceLock::new(),
            stats: RingStatsInner {
                enqueued: AtomicU64::new(0),
                dequeued: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                max_depth: AtomicU64::new(0),
            },
        }
    }

    /// Attach the consumer's wake watcher. May be set once, during init.
    pub fn attach_watcher(&self, watcher: Arc<Watcher>) {
        let _ = self.watcher.set(watcher);
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// High-water mark.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Current occupancy.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    /// Whether the ring holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether occupancy is at or above the high-water mark.
    pub fn above_high_water(&self) -> bool {
        self.len() >= self.high_water
    }

    /// Try to enqueue one item. Never blocks; a full ring hands the item
    /// back. Signals the attached watcher on the empty-to-nonempty edge
    /// and once per below-to-above high-water transition.
    pub fn try_enqueue(&self, item: T) -> std::result::Result<(), RingFull<T>> {
        let _guard = self.producer_lock.as_ref().map(|l| l.lock());

        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let depth = head.wrapping_sub(tail) as usize;
        if depth >= self.capacity {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RingFull(item));
        }

        let index = (head as usize) & self.mask;
        *self.slots[index].lock() = Some(item);
        self.head.store(head.wrapping_add(1), Ordering::Release);

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        let new_depth = depth + 1;
        self.update_max_depth(new_depth as u64);

        let was_empty = depth == 0;
        let crossed_mark = new_depth >= self.high_water
            && !self.above_mark.swap(true, Ordering::AcqRel);
        if was_empty || crossed_mark {
            if let Some(w) = self.watcher.get() {
                w.signal();
            }
        }
        Ok(())
    }

    /// Try to dequeue one item. Single consumer only.
    pub fn try_dequeue(&self) -> Result<T> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return Err(Error::RingEmpty);
        }

        let index = (tail as usize) & self.mask;
        let item = self.slots[index].lock().take().ok_or(Error::RingEmpty)?;
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);

        let depth = head.wrapping_sub(tail.wrapping_add(1)) as usize;
        if depth < self.high_water {
            self.above_mark.store(false, Ordering::Release);
        }
        Ok(item)
    }

    /// Drain up to `max` items into `out`, returning the count.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.try_dequeue() {
                Ok(item) => {
                    out.push(item);
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }

    /// Snapshot the ring counters.
    pub fn stats(&self) -> RingStats {
        RingStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dequeued: self.stats.dequeued.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            depth: self.len() as u64,
            max_depth: self.stats.max_depth.load(Ordering::Relaxed),
        }
    }

    fn update_max_depth(&self, depth: u64) {
        let mut max = self.stats.max_depth.load(Ordering::Relaxed);
        while depth > max {
            match self.stats.max_depth.compare_exchange_weak(
                max,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
    }
}

struct LoopSignal {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl LoopSignal {
    fn notify(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.cond.notify_one();
    }
}

/// Edge-triggered cross-thread wake primitive.
///
/// `signal` sets the pending flag and wakes the attached event loop; a
/// watcher that is already pending absorbs further signals. The consumer
/// claims the wake with `take` and must drain its source until empty
/// before parking again.
pub struct Watcher {
    pending: AtomicBool,
    fires: AtomicU64,
    target: OnceLock<Arc<LoopSignal>>,
}

impl Watcher {
    /// Create a detached watcher. Attach it to the owning thread's loop
    /// with [`EventLoop::register`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicBool::new(false),
            fires: AtomicU64::new(0),
            target: OnceLock::new(),
        })
    }

    /// Signal the watcher. Returns true if it was newly raised.
    pub fn signal(&self) -> bool {
        let newly = !self.pending.swap(true, Ordering::AcqRel);
        if newly {
            self.fires.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(target) = self.target.get() {
            target.notify();
        }
        newly
    }

    /// Claim a pending wake, clearing it. Returns whether one was pending.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Whether a wake is pending.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// How many times the watcher transitioned from idle to pending.
    pub fn fire_count(&self) -> u64 {
        self.fires.load(Ordering::Relaxed)
    }
}

/// Per-thread wake multiplexer.
///
/// One loop serves all watchers a thread owns (SW-RX, task output,
/// termination); `park` blocks until any registered watcher signals.
pub struct EventLoop {
    signal: Arc<LoopSignal>,
}

impl EventLoop {
    /// Create the loop for the calling thread.
    pub fn new() -> Self {
        Self {
            signal: Arc::new(LoopSignal {
                woken: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Bind a watcher to this loop. A signal raised before registration is
    /// re-delivered so the first park does not miss it.
    pub fn register(&self, watcher: &Arc<Watcher>) {
        let _ = watcher.target.set(Arc::clone(&self.signal));
        if watcher.is_pending() {
            self.signal.notify();
        }
    }

    /// Block until a registered watcher signals.
    pub fn park(&self) {
        let mut woken = self.signal.woken.lock();
        while !*woken {
            self.signal.cond.wait(&mut woken);
        }
        *woken = false;
    }

    /// Block with a timeout. Returns true if woken by a signal.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        let mut woken = self.signal.woken.lock();
        if !*woken {
            let _ = self.signal.cond.wait_for(&mut woken, timeout);
        }
        let was = *woken;
        *woken = false;
        was
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_enqueue_dequeue() {
        let ring: Ring<u32> = Ring::new(16, ProducerMode::Single);
        assert!(ring.is_empty());
        ring.try_enqueue(7).unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.try_dequeue().unwrap(), 7);
        assert!(matches!(ring.try_dequeue(), Err(Error::RingEmpty)));
    }

    #[test]
    fn test_full_ring_hands_item_back() {
        let ring: Ring<u32> = Ring::new(4, ProducerMode::Single);
        for i in 0..4 {
            ring.try_enqueue(i).unwrap();
        }
        let RingFull(item) = ring.try_enqueue(99).unwrap_err();
        assert_eq!(item, 99);
        assert_eq!(ring.stats().rejected, 1);
    }

    #[test]
    fn test_watcher_fires_once_per_transition() {
        let ring: Ring<u32> = Ring::with_high_water(8, ProducerMode::Single, 4);
        let watcher = Watcher::new();
        ring.attach_watcher(Arc::clone(&watcher));

        // Fill past the mark without draining: the empty->nonempty edge
        // raises the watcher once; everything after coalesces.
        for i in 0..8 {
            ring.try_enqueue(i).unwrap();
        }
        assert_eq!(watcher.fire_count(), 1);
        assert!(watcher.take());

        // Drain below the mark, then cross it again: exactly one more fire.
        let mut out = Vec::new();
        ring.dequeue_burst(&mut out, 8);
        for i in 0..8 {
            ring.try_enqueue(i).unwrap();
        }
        assert_eq!(watcher.fire_count(), 2);
    }

    #[test]
    fn test_nonempty_ring_has_signaled_watcher() {
        let ring: Ring<u32> = Ring::new(8, ProducerMode::Single);
        let watcher = Watcher::new();
        ring.attach_watcher(Arc::clone(&watcher));
        ring.try_enqueue(1).unwrap();
        assert!(watcher.is_pending());
    }

    #[test]
    fn test_multi_producer() {
        let ring: Arc<Ring<u64>> = Arc::new(Ring::new(1024, ProducerMode::Multi));
        let mut handles = Vec::new();
        for t in 0..4 {
            let r = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..100u64 {
                    r.try_enqueue(t * 1000 + i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ring.len(), 400);
        assert_eq!(ring.stats().enqueued, 400);
    }

    #[test]
    fn test_event_loop_wakeup() {
        let watcher = Watcher::new();
        let event_loop = EventLoop::new();
        event_loop.register(&watcher);

        let w = Arc::clone(&watcher);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            w.signal();
        });
        event_loop.park();
        assert!(watcher.take());
        h.join().unwrap();
    }

    #[test]
    fn test_signal_before_register_is_not_lost() {
        let watcher = Watcher::new();
        watcher.signal();
        let event_loop = EventLoop::new();
        event_loop.register(&watcher);
        assert!(event_loop.park_timeout(Duration::from_millis(50)));
        assert!(watcher.take());
    }

    #[test]
    fn test_park_timeout_expires() {
        let event_loop = EventLoop::new();
        assert!(!event_loop.park_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_burst_drain() {
        let ring: Ring<u32> = Ring::new(32, ProducerMode::Single);
        for i in 0..20 {
            ring.try_enqueue(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(ring.dequeue_burst(&mut out, 16), 16);
        assert_eq!(out.len(), 16);
        assert_eq!(ring.len(), 4);
        assert_eq!(out[0], 0);
        assert_eq!(out[15], 15);
    }
}
