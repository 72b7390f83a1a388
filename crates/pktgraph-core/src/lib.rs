//! # pktgraph-core
//!
//! Core types and primitives for the pktgraph packet-processing runtime:
//! the NUMA-aware resource plane, the watermarked rings and edge-triggered
//! watchers that connect the thread tiers, the packet/annotation/batch
//! data model, the datablock layer offloadable elements describe their
//! device I/O with, node-local storage, the compute-device contract, and
//! the typed configuration records.
//!
//! The engine itself (elements, graph, thread loops, orchestrator) lives
//! in the `pktgraph` crate; the emulated compute backend in `pktgraph-cpu`.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod anno;
pub mod barrier;
pub mod batch;
pub mod compute;
pub mod config;
pub mod datablock;
pub mod error;
pub mod mempool;
pub mod nls;
pub mod packet;
pub mod ring;
pub mod topology;

pub use anno::{AnnoSlot, Annotation};
pub use barrier::CountedBarrier;
pub use batch::PacketBatch;
pub use compute::{
    CompletionStatus, ComputeContext, ComputeDevice, ContextState, DeviceBufferId, DeviceKind,
    KernelArg, KernelLaunch, KernelRef, OffloadArm, ResourceParam, SharedContext, StagingRegion,
};
pub use config::{PipelineConfig, SystemConfig};
pub use datablock::{DatablockDesc, DatablockId, DatablockRegistry, PreparedDatablock, Roi};
pub use error::{Error, Result};
pub use mempool::{PacketPool, PoolBuf};
pub use nls::NodeLocalStorage;
pub use packet::Packet;
pub use ring::{EventLoop, ProducerMode, Ring, RingFull, RingStats, Watcher};
pub use topology::{bind_current_thread, Location, Topology};
