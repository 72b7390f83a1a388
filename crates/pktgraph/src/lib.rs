//! # pktgraph
//!
//! A high-throughput software packet processor: a user-configured directed
//! graph of packet-processing elements runs across pinned CPU cores, with
//! poll-mode I/O threads feeding per-core computation threads through
//! watermarked rings, and offloadable elements shipping batched work to a
//! per-node coprocessor thread that owns a compute device.
//!
//! Crate layout mirrors the thread tiers:
//!
//! - [`element`] / [`elements`]: the element contract and the drop-in
//!   stages (`FromDevice`, `ToDevice`, `Discard`, `Identity`,
//!   `L2ForwardCreate`, `IPsecAuthHMACSHA1`).
//! - [`graph`]: the element graph, batch routing, and the offload
//!   park/resume machinery.
//! - [`io`], [`comp`], [`coproc`]: the three thread loops.
//! - [`system`]: the orchestrator that wires everything per the
//!   configuration and owns process lifecycle.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod comp;
pub mod coproc;
pub mod element;
pub mod elements;
pub mod graph;
pub mod io;
pub mod stats;
pub mod system;
pub mod task;

pub use element::{ConfigContext, Disposition, Element, ElementSlot, OffloadableElement};
pub use graph::{ElementGraph, GraphEnv, OffloadEnv, RunOutcome};
pub use io::{LoopbackDriver, PacketDriver, PortInfo, PortQueueConf, RxBurst};
pub use stats::{NodeStats, PortStatsSnapshot};
pub use system::{ProcessLock, RunOptions, System};
