//! The per-node coprocessor loop.
//!
//! One thread per node with a device. It owns the device outright: every
//! buffer allocation, copy, and kernel launch happens here, so the command
//! stream never needs a lock. Before entering the steady loop the thread
//! honors the offloadable-init rendezvous, running element device-init
//! against the graph the orchestrator parks in the init cell.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::graph::ElementGraph;
use crate::task::{OffloadTask, TaskCompletion};
use pktgraph_core::{
    bind_current_thread, ComputeDevice, CountedBarrier, Error, EventLoop, Location,
    NodeLocalStorage, Ring, RingFull, Watcher,
};

/// Rendezvous slot for offloadable-element device init. The orchestrator
/// parks the first computation context's graph here; the coprocessor
/// thread runs `initialize_offloadables` on it and parks it back.
#[derive(Default)]
pub struct OffloadInitCell {
    /// Graph in transit between the orchestrator and this thread.
    pub graph: Option<ElementGraph>,
    /// Error raised by device init, checked by the orchestrator.
    pub error: Option<Error>,
}

/// One coprocessor thread.
pub struct CoprocThread {
    /// Thread placement.
    pub loc: Location,
    /// The device this thread owns.
    pub device: Box<dyn ComputeDevice>,
    /// Task-input ring this thread consumes.
    pub task_ring: Arc<Ring<OffloadTask>>,
    /// Watcher attached to the task-input ring.
    pub input_watcher: Arc<Watcher>,
    /// Termination watcher.
    pub term: Arc<Watcher>,
    /// Max tasks dispatched per wake.
    pub ppdepth: usize,
    /// This node's storage.
    pub nls: Arc<NodeLocalStorage>,
    /// Raised once the loop and device are initialized.
    pub init_done: Arc<CountedBarrier>,
    /// Released by the orchestrator when the init cell is loaded.
    pub offload_init: Arc<CountedBarrier>,
    /// Raised once device init of offloadables finished.
    pub offload_init_done: Arc<CountedBarrier>,
    /// Released by the orchestrator to enter the steady loop.
    pub loopstart: Arc<CountedBarrier>,
    /// Graph rendezvous slot.
    pub init_cell: Arc<Mutex<OffloadInitCell>>,
}

impl CoprocThread {
    /// Run init rendezvous and the steady loop until termination.
    pub fn run(mut self) {
        if let Err(e) = bind_current_thread(self.loc.core_id) {
            warn!(core = self.loc.core_id, "cpu pinning failed: {}", e);
        }
        let event_loop = EventLoop::new();
        event_loop.register(&self.input_watcher);
        event_loop.register(&self.term);
        info!(
            node = self.loc.node_id,
            core = self.loc.core_id,
            device = self.device.name(),
            "coprocessor thread up"
        );
        self.init_done.proceed();

        // Offloadable-init rendezvous: device buffers must be created on
        // the thread that owns the command stream.
        self.offload_init.wait();
        {
            let mut cell = self.init_cell.lock();
            if let Some(graph) = cell.graph.as_mut() {
                if let Err(e) = graph.initialize_offloadables(&mut *self.device, &self.nls) {
                    warn!("offloadable device init failed: {}", e);
                    cell.error = Some(e);
                }
            }
        }
        self.offload_init_done.proceed();

        self.loopstart.wait();
        debug!(node = self.loc.node_id, "coprocessor loop start");

        loop {
            if self.term.take() {
                break;
            }
            let mut dispatched = 0;
            while dispatched < self.ppdepth {
                let Ok(task) = self.task_ring.try_dequeue() else {
                    break;
                };
                dispatched += 1;
                self.execute(task);
            }
            if dispatched == 0 {
                self.input_watcher.take();
                if self.task_ring.is_empty() {
                    event_loop.park_timeout(Duration::from_millis(50));
                }
            }
        }

        // Drain leftover tasks so parked batches see a completion before
        // their computation thread exits.
        while let Ok(task) = self.task_ring.try_dequeue() {
            self.execute(task);
        }
        debug!(node = self.loc.node_id, "coprocessor thread down");
    }

    /// Host copy, argument pushes, launch, copy-back, completion.
    fn execute(&mut self, task: OffloadTask) {
        let status = {
            let mut guard = task.cctx.lock();
            for arg in &task.args {
                guard.push_kernel_arg(*arg);
            }
            match guard.enqueue_kernel_launch(&task.kernel, task.res, &task.datablocks) {
                Ok(()) => guard.sync(),
                Err(e) => {
                    warn!(task_id = task.task_id, "kernel launch failed: {}", e);
                    // Reset the context so it can be reclaimed.
                    guard.sync()
                }
            }
        };
        let completion = TaskCompletion {
            task_id: task.task_id,
            status,
        };
        if let Err(RingFull(_)) = task.completion_ring.try_enqueue(completion) {
            warn!(task_id = task.task_id, "completion ring full, task lost");
        }
    }
}
