//! Node-local packet buffer pools.
//!
//! Each hardware RX queue gets three pools at port bring-up: received
//! packets, synthesized packets, and request records. Pools preallocate
//! their whole population on the owning node; exhaustion in the steady
//! state is a drop, exhaustion at init is fatal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

struct PoolInner {
    name: String,
    node_id: usize,
    buf_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    allocations: AtomicU64,
    exhaustions: AtomicU64,
}

/// A fixed-population buffer pool pinned to one NUMA node.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
    capacity: usize,
}

impl PacketPool {
    /// Create a pool and preallocate `capacity` buffers of `buf_size` bytes.
    pub fn new(name: impl Into<String>, node_id: usize, buf_size: usize, capacity: usize) -> Result<Self> {
        if buf_size == 0 || capacity == 0 {
            return Err(Error::AllocationFailed { size: buf_size });
        }
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(vec![0u8; buf_size].into_boxed_slice());
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                node_id,
                buf_size,
                free: Mutex::new(free),
                allocations: AtomicU64::new(0),
                exhaustions: AtomicU64::new(0),
            }),
            capacity,
        })
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// NUMA node this pool's memory belongs to.
    pub fn node_id(&self) -> usize {
        self.inner.node_id
    }

    /// Size of each buffer in bytes.
    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// Total buffer population.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently available.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Take a buffer. Returns `None` when the pool is exhausted.
    pub fn try_alloc(&self) -> Option<PoolBuf> {
        let buf = self.inner.free.lock().pop();
        match buf {
            Some(data) => {
                self.inner.allocations.fetch_add(1, Ordering::Relaxed);
                Some(PoolBuf {
                    data: Some(data),
                    pool: Arc::clone(&self.inner),
                })
            }
            None => {
                self.inner.exhaustions.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Total successful allocations.
    pub fn allocations(&self) -> u64 {
        self.inner.allocations.load(Ordering::Relaxed)
    }

    /// Allocation attempts that found the pool empty.
    pub fn exhaustions(&self) -> u64 {
        self.inner.exhaustions.load(Ordering::Relaxed)
    }
}

/// A buffer borrowed from a [`PacketPool`]; returns on drop.
///
/// Owns an `Arc` to its pool so it may cross threads and outlive the
/// borrowing scope (packets travel from I/O threads through the graph and
/// back to a different thread's drop ring).
pub struct PoolBuf {
    data: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl PoolBuf {
    /// Full buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Mutable buffer contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    /// Buffer size in bytes.
    pub fn len(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    /// Whether the buffer is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.free.lock().push(data);
        }
    }
}

impl std::ops::Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl std::ops::DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}
