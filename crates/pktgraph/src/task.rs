//! Offload task records crossing the computation/coprocessor boundary.

use std::collections::HashMap;
use std::sync::Arc;

use pktgraph_core::{
    CompletionStatus, KernelArg, KernelRef, PacketBatch, PreparedDatablock, ResourceParam, Ring,
    SharedContext,
};

/// One staged offload, pushed to a coprocessor's task-input ring.
pub struct OffloadTask {
    /// Monotonic id assigned by the originating computation thread; the
    /// completion carries it back.
    pub task_id: u64,
    /// Context whose staging memory holds the gathered datablocks.
    pub cctx: SharedContext,
    /// Kernel to launch.
    pub kernel: KernelRef,
    /// Launch geometry.
    pub res: ResourceParam,
    /// Kernel arguments, element pointer-table first.
    pub args: Vec<KernelArg>,
    /// Datablock snapshot shared with the parked batch.
    pub datablocks: Arc<Vec<PreparedDatablock>>,
    /// Completion ring of the originating computation thread.
    pub completion_ring: Arc<Ring<TaskCompletion>>,
}

/// Completion record pushed back by the coprocessor.
#[derive(Debug, Clone, Copy)]
pub struct TaskCompletion {
    /// Id of the finished task.
    pub task_id: u64,
    /// Outcome of the launch.
    pub status: CompletionStatus,
}

/// A batch parked while its offload is in flight.
pub struct ParkedTask {
    /// The batch; offloaded packets stay in their slots, marked pending.
    pub batch: PacketBatch,
    /// Saved per-element input lists of the suspended traversal.
    pub inputs: Vec<Vec<(usize, usize)>>,
    /// Topological position of the offloadable element.
    pub node_topo_pos: usize,
    /// (slot index, input port) of every offloaded packet, in order.
    pub items: Vec<(usize, usize)>,
    /// Context to reclaim on completion.
    pub cctx: SharedContext,
    /// Datablock snapshot used for output copy-back.
    pub datablocks: Arc<Vec<PreparedDatablock>>,
}

/// Fixed-capacity map of in-flight offloads, keyed by task id.
pub struct InFlightMap {
    map: HashMap<u64, ParkedTask>,
    capacity: usize,
}

impl InFlightMap {
    /// Create a map bounded to `capacity` concurrent tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether another task may be parked.
    pub fn has_room(&self) -> bool {
        self.map.len() < self.capacity
    }

    /// Park a task. Returns it back when the map is full.
    pub fn insert(&mut self, task_id: u64, parked: ParkedTask) -> Option<ParkedTask> {
        if !self.has_room() {
            return Some(parked);
        }
        self.map.insert(task_id, parked);
        None
    }

    /// Reclaim a parked task by completion id.
    pub fn remove(&mut self, task_id: u64) -> Option<ParkedTask> {
        self.map.remove(&task_id)
    }

    /// Number of in-flight tasks.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drain everything (termination path; offloads are abandoned).
    pub fn drain(&mut self) -> Vec<ParkedTask> {
        self.map.drain().map(|(_, v)| v).collect()
    }
}
