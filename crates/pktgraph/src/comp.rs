//! The per-core computation loop.
//!
//! Three wake sources: offload completions, SW-RX batches, termination.
//! Completions drain first so parked batches release their compute
//! contexts before new work stages more; both drains are bounded per wake
//! so neither source starves the other.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::graph::{ElementGraph, GraphEnv, RunOutcome};
use crate::task::{InFlightMap, TaskCompletion};
use pktgraph_core::{bind_current_thread, EventLoop, Location, PacketBatch, Ring, Watcher};

/// One computation thread, paired with one I/O thread through its SW-RX
/// ring.
pub struct CompThread {
    /// Thread placement.
    pub loc: Location,
    /// The per-thread element graph.
    pub graph: ElementGraph,
    /// SW-RX ring this thread consumes.
    pub swrx: Arc<Ring<PacketBatch>>,
    /// Watcher attached to the SW-RX ring.
    pub rx_watcher: Arc<Watcher>,
    /// Completion ring, when this thread offloads.
    pub completion_ring: Option<Arc<Ring<TaskCompletion>>>,
    /// Watcher attached to the completion ring.
    pub completion_watcher: Option<Arc<Watcher>>,
    /// Termination watcher.
    pub term: Arc<Watcher>,
    /// Rings, counters, and offload plumbing the graph walks against.
    pub env: GraphEnv,
    /// Parked batches keyed by task id.
    pub in_flight: InFlightMap,
    /// Batches handled per wake and per source.
    pub drain_quota: usize,
}

impl CompThread {
    /// Run the event loop until the termination watcher fires.
    pub fn run(mut self) {
        if let Err(e) = bind_current_thread(self.loc.core_id) {
            warn!(core = self.loc.core_id, "cpu pinning failed: {}", e);
        }
        let event_loop = EventLoop::new();
        event_loop.register(&self.rx_watcher);
        event_loop.register(&self.term);
        if let Some(w) = &self.completion_watcher {
            event_loop.register(w);
        }
        info!(
            node = self.loc.node_id,
            core = self.loc.core_id,
            offload = self.completion_ring.is_some(),
            "computation thread up"
        );

        loop {
            if self.term.take() {
                break;
            }

            let completions = self.drain_completions();
            let batches = self.drain_swrx();

            if completions == 0 && batches == 0 {
                if !self.swrx.is_empty() || self.completions_waiting() {
                    continue;
                }
                event_loop.park_timeout(Duration::from_millis(50));
            }
        }

        // In-flight offloads are abandoned on termination: their packets
        // return to the pools, their completions are discarded.
        let abandoned = self.in_flight.drain();
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "abandoning in-flight offloads");
        }
        drop(abandoned);
        if let Some(ring) = &self.completion_ring {
            while ring.try_dequeue().is_ok() {}
        }
        debug!(
            node = self.loc.node_id,
            core = self.loc.core_id,
            "computation thread down"
        );
    }

    fn completions_waiting(&self) -> bool {
        self.completion_ring
            .as_ref()
            .map(|r| !r.is_empty())
            .unwrap_or(false)
    }

    fn drain_completions(&mut self) -> usize {
        let Some(ring) = self.completion_ring.clone() else {
            return 0;
        };
        if let Some(w) = &self.completion_watcher {
            w.take();
        }
        let mut handled = 0;
        while handled < self.drain_quota {
            let Ok(completion) = ring.try_dequeue() else {
                break;
            };
            handled += 1;
            self.handle_completion(completion);
        }
        handled
    }

    fn handle_completion(&mut self, completion: TaskCompletion) {
        let Some(parked) = self.in_flight.remove(completion.task_id) else {
            warn!(task_id = completion.task_id, "completion for unknown task");
            return;
        };
        match self.graph.resume(parked, completion.status, &mut self.env) {
            Ok(RunOutcome::Done) => {}
            Ok(RunOutcome::Parked { task_id, parked }) => {
                if let Some(rejected) = self.in_flight.insert(task_id, parked) {
                    error!(task_id, "in-flight map full on resume, dropping batch");
                    drop(rejected);
                }
            }
            Err(e) => error!("resume failed: {}", e),
        }
    }

    fn drain_swrx(&mut self) -> usize {
        self.rx_watcher.take();
        let mut handled = 0;
        while handled < self.drain_quota {
            let Ok(batch) = self.swrx.try_dequeue() else {
                break;
            };
            handled += 1;
            match self.graph.run_batch(batch, &mut self.env) {
                Ok(RunOutcome::Done) => {}
                Ok(RunOutcome::Parked { task_id, parked }) => {
                    if let Some(rejected) = self.in_flight.insert(task_id, parked) {
                        error!(task_id, "in-flight map full, dropping batch");
                        drop(rejected);
                    }
                }
                Err(e) => error!("batch run failed: {}", e),
            }
        }
        handled
    }
}
