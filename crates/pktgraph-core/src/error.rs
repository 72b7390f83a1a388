//! Error type shared across the pktgraph crates.

use thiserror::Error;

/// Errors produced by the runtime and its primitives.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Enqueue on a full ring.
    #[error("ring full (capacity {capacity})")]
    RingFull {
        /// Capacity of the ring that rejected the enqueue.
        capacity: usize,
    },

    /// Dequeue on an empty ring.
    #[error("ring empty")]
    RingEmpty,

    /// A node-local storage key was allocated twice on the same node.
    #[error("node-local storage key '{0}' already allocated")]
    NlsDuplicateKey(String),

    /// Lookup of a node-local storage key that was never allocated.
    #[error("node-local storage key '{0}' not found")]
    NlsMissingKey(String),

    /// Host or pool memory allocation failed.
    #[error("allocation of {size} bytes failed")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
    },

    /// Compute device or context failure.
    #[error("device error: {0}")]
    Device(String),

    /// The compute-context pool is exhausted.
    #[error("no compute context available")]
    NoContext,

    /// NIC driver failure (port bring-up, queue setup, link down).
    #[error("driver error: {0}")]
    Driver(String),

    /// Element graph construction or validation failure.
    #[error("graph error: {0}")]
    Graph(String),

    /// Element configure/initialize failure.
    #[error("element '{name}': {reason}")]
    Element {
        /// Class name of the failing element.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// Another instance already holds the process lock.
    #[error("process lock held by another instance")]
    LockCollision,

    /// Worker thread spawn or join failure.
    #[error("thread error: {0}")]
    Thread(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout pktgraph.
pub type Result<T> = std::result::Result<T, Error>;
