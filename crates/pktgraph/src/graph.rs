//! The element graph and its batch-propagation discipline.
//!
//! A batch pulled from the SW-RX ring walks the elements in topological
//! order. Each element sees its input packets in slot order, so relative
//! order is preserved through any prefix of plain elements; killed packets
//! leave tombstones, and packets that reach a TX sink move to the owning
//! I/O thread's per-port TX ring grouped by destination port.
//!
//! When the walk reaches an offloadable element and the node has a device,
//! the element's datablocks are gathered into a compute context and the
//! batch parks until the completion comes back; the traversal then resumes
//! from the offloadable element's output port. Without a device, without a
//! matching offload arm, or with the context pool empty, the element's CPU
//! path runs inline instead.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::element::{ConfigContext, Disposition, ElementSlot};
use crate::elements::create_element;
use crate::stats::NodeStats;
use crate::task::{OffloadTask, ParkedTask, TaskCompletion};
use pktgraph_core::datablock::{prepare_datablock, roi_check};
use pktgraph_core::{
    CompletionStatus, ComputeDevice, DatablockRegistry, DeviceKind, Error, NodeLocalStorage,
    Packet, PacketBatch, PipelineConfig, PreparedDatablock, ResourceParam, Result, Ring, RingFull,
    SharedContext,
};

/// Where one output port leads.
#[derive(Debug, Clone, Copy)]
pub enum PortTarget {
    /// Downstream element input.
    Element {
        /// Node index.
        idx: usize,
        /// Input port on that node.
        in_port: usize,
    },
    /// TX ring of a hardware port.
    TxPort(u16),
}

/// One instantiated element inside the graph.
pub struct GraphNode {
    /// Pipeline-IR id this node was built from.
    pub decl_id: usize,
    /// The element instance.
    pub slot: ElementSlot,
    out: Vec<PortTarget>,
}

/// Offload plumbing available to a computation thread.
pub struct OffloadEnv {
    /// Device family of the node's coprocessor.
    pub device_kind: DeviceKind,
    /// Task-input ring toward the coprocessor.
    pub task_ring: Arc<Ring<OffloadTask>>,
    /// This thread's completion ring.
    pub completion_ring: Arc<Ring<TaskCompletion>>,
    /// Contexts bound to this thread; bounds concurrent offloads.
    pub cctx_pool: Vec<SharedContext>,
    /// Process-wide datablock registry.
    pub registry: Arc<DatablockRegistry>,
    /// This node's storage (element device handles live here).
    pub nls: Arc<NodeLocalStorage>,
    /// Monotonic task-id source.
    pub next_task_id: u64,
}

/// Everything a graph walk touches outside the graph itself.
pub struct GraphEnv {
    /// Per-port TX rings of the paired I/O thread.
    pub tx_rings: Vec<Arc<Ring<Packet>>>,
    /// Drop ring of the paired I/O thread.
    pub drop_ring: Arc<Ring<Packet>>,
    /// Node counters.
    pub stats: Arc<NodeStats>,
    /// Prefer dropping over queueing once a TX ring is past its mark.
    pub preserve_latency: bool,
    /// Offload plumbing, when the node has a coprocessor.
    pub offload: Option<OffloadEnv>,
}

/// Result of pushing one batch through the graph.
pub enum RunOutcome {
    /// Every packet reached a TX ring or the drop ring.
    Done,
    /// The batch parked behind an in-flight offload.
    Parked {
        /// Task id the completion will carry.
        task_id: u64,
        /// State to stash in the in-flight map.
        parked: ParkedTask,
    },
}

enum OffloadAttempt {
    Parked {
        task_id: u64,
        items: Vec<(usize, usize)>,
        cctx: SharedContext,
        datablocks: Arc<Vec<PreparedDatablock>>,
    },
    Fallback(Vec<(usize, usize)>),
}

enum DropClass {
    Sw,
    Invalid,
    SlowPath,
}

/// The per-thread element graph.
pub struct ElementGraph {
    nodes: Vec<GraphNode>,
    order: Vec<usize>,
    roots: Vec<usize>,
}

impl ElementGraph {
    /// Instantiate, configure, wire, and topologically order the pipeline.
    pub fn build(pipeline: &PipelineConfig, ctx: &ConfigContext) -> Result<Self> {
        let mut nodes = Vec::with_capacity(pipeline.elements.len());
        for decl in &pipeline.elements {
            let mut slot = create_element(&decl.class)?;
            slot.configure(ctx, &decl.args)?;
            nodes.push(GraphNode {
                decl_id: decl.id,
                slot,
                out: Vec::new(),
            });
        }

        let arities: Vec<(usize, usize)> = nodes.iter().map(|n| n.slot.port_counts()).collect();
        let mut out: Vec<Vec<Option<PortTarget>>> = arities
            .iter()
            .map(|(_, oa)| vec![None; *oa])
            .collect();
        let mut in_degree = vec![0usize; nodes.len()];

        for edge in &pipeline.edges {
            if edge.src >= nodes.len() || edge.dst >= nodes.len() {
                return Err(Error::Graph(format!(
                    "edge references element {} out of range",
                    edge.src.max(edge.dst)
                )));
            }
            if edge.src_port >= arities[edge.src].1 {
                return Err(Error::Graph(format!(
                    "{}[{}] exceeds its {} output ports",
                    nodes[edge.src].slot.class_name(),
                    edge.src_port,
                    arities[edge.src].1
                )));
            }
            if edge.dst_port >= arities[edge.dst].0 {
                return Err(Error::Graph(format!(
                    "[{}]{} exceeds its {} input ports",
                    edge.dst_port,
                    nodes[edge.dst].slot.class_name(),
                    arities[edge.dst].0
                )));
            }
            let slot = &mut out[edge.src][edge.src_port];
            if slot.is_some() {
                return Err(Error::Graph(format!(
                    "{}[{}] wired twice",
                    nodes[edge.src].slot.class_name(),
                    edge.src_port
                )));
            }
            *slot = Some(PortTarget::Element {
                idx: edge.dst,
                in_port: edge.dst_port,
            });
            in_degree[edge.dst] += 1;
        }

        // Sinks take their unwired output port; anything else unwired is a
        // configuration error.
        for (i, node) in nodes.iter().enumerate() {
            for (port, target) in out[i].iter_mut().enumerate() {
                if target.is_some() {
                    continue;
                }
                match node.slot.tx_port() {
                    Some(tx) => *target = Some(PortTarget::TxPort(tx)),
                    None => {
                        return Err(Error::Graph(format!(
                            "{}[{}] is not wired and is not a sink",
                            node.slot.class_name(),
                            port
                        )));
                    }
                }
            }
        }
        for (i, node) in nodes.iter().enumerate() {
            if node.slot.tx_port().is_some()
                && !out[i]
                    .iter()
                    .all(|t| matches!(t, Some(PortTarget::TxPort(_))))
            {
                return Err(Error::Graph(format!(
                    "{} output must stay unwired",
                    node.slot.class_name()
                )));
            }
        }

        for (node, targets) in nodes.iter_mut().zip(out) {
            node.out = targets.into_iter().map(|t| t.unwrap()).collect();
        }

        // Kahn's ordering; a leftover node means a cycle.
        let mut order = Vec::with_capacity(nodes.len());
        let mut degree = in_degree.clone();
        let mut ready: Vec<usize> = degree
            .iter()
            .enumerate()
            .filter_map(|(i, d)| (*d == 0).then_some(i))
            .collect();
        while let Some(idx) = ready.pop() {
            order.push(idx);
            for target in &nodes[idx].out {
                if let PortTarget::Element { idx: next, .. } = target {
                    degree[*next] -= 1;
                    if degree[*next] == 0 {
                        ready.push(*next);
                    }
                }
            }
        }
        if order.len() != nodes.len() {
            return Err(Error::Graph("pipeline contains a cycle".into()));
        }

        let roots: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter_map(|(i, d)| (*d == 0).then_some(i))
            .collect();
        if roots.is_empty() {
            return Err(Error::Graph("pipeline has no root element".into()));
        }

        debug!(
            elements = nodes.len(),
            roots = roots.len(),
            "element graph built"
        );
        Ok(Self {
            nodes,
            order,
            roots,
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds no elements.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Register every offloadable element's datablocks (first context only).
    pub fn register_datablocks(&self, registry: &mut DatablockRegistry) -> Result<()> {
        for node in &self.nodes {
            if let Some(off) = node.slot.offloadable() {
                for desc in off.datablocks() {
                    if registry.id_of(desc.name).is_none() {
                        let id = registry.register(desc)?;
                        debug!(id, "datablock registered");
                    }
                }
            }
        }
        Ok(())
    }

    /// Phase 1: process-wide element init (first computation context only).
    pub fn initialize_global(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.slot.initialize_global()?;
        }
        Ok(())
    }

    /// Phase 2: per-node element init (once per populated node).
    pub fn initialize_per_node(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        for node in &mut self.nodes {
            node.slot.initialize_per_node(nls)?;
        }
        Ok(())
    }

    /// Phase 3: device init for offloadable elements; runs on the
    /// coprocessor thread owning the device command stream.
    pub fn initialize_offloadables(
        &mut self,
        device: &mut dyn ComputeDevice,
        nls: &NodeLocalStorage,
    ) -> Result<()> {
        for node in &mut self.nodes {
            if let Some(off) = node.slot.offloadable_mut() {
                off.accel_init(device, nls)?;
            }
        }
        Ok(())
    }

    /// Phase 4: per-thread element init.
    pub fn initialize(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        for node in &mut self.nodes {
            node.slot.initialize(nls)?;
        }
        Ok(())
    }

    /// Push one fresh batch through the graph.
    pub fn run_batch(&mut self, batch: PacketBatch, env: &mut GraphEnv) -> Result<RunOutcome> {
        let mut inputs: Vec<Vec<(usize, usize)>> = vec![Vec::new(); self.nodes.len()];
        for &root in &self.roots {
            let filter = self.nodes[root].slot.rx_port();
            for idx in batch.alive_indices() {
                let port = batch.get(idx).map(|p| p.port()).unwrap_or(0);
                if filter.map_or(true, |f| f == port) {
                    inputs[root].push((idx, 0));
                }
            }
        }
        self.walk(batch, inputs, 0, None, env)
    }

    /// Reinject a parked batch after its completion arrived.
    pub fn resume(
        &mut self,
        parked: ParkedTask,
        status: CompletionStatus,
        env: &mut GraphEnv,
    ) -> Result<RunOutcome> {
        let ParkedTask {
            mut batch,
            inputs,
            node_topo_pos,
            items,
            cctx,
            datablocks,
        } = parked;
        batch.pending_offloads = 0;

        if status == CompletionStatus::Failed {
            warn!(batch_id = batch.batch_id, "offload failed, abandoning batch");
            if let Some(oenv) = env.offload.as_mut() {
                oenv.cctx_pool.push(cctx);
            }
            let pkts = batch.drain();
            for pkt in pkts {
                drop_packet(pkt, DropClass::Sw, env);
            }
            return Ok(RunOutcome::Done);
        }

        // Copy writable regions back into packet memory.
        {
            let guard = cctx.lock();
            let out = guard.output_bytes();
            for db in datablocks.iter() {
                for item in &db.items {
                    if item.out_len == 0 {
                        continue;
                    }
                    if let Some(pkt) = batch.get_mut(item.pkt_idx) {
                        let off = item.pkt_write_off as usize;
                        let len = item.out_len as usize;
                        let src = item.out_off as usize;
                        pkt.data_mut()[off..off + len].copy_from_slice(&out[src..src + len]);
                    }
                }
            }
        }
        if let Some(oenv) = env.offload.as_mut() {
            oenv.cctx_pool.push(cctx);
        }

        let node_idx = self.order[node_topo_pos];
        self.walk(batch, inputs, node_topo_pos + 1, Some((node_idx, items)), env)
    }

    fn walk(
        &mut self,
        mut batch: PacketBatch,
        mut inputs: Vec<Vec<(usize, usize)>>,
        start_pos: usize,
        postproc: Option<(usize, Vec<(usize, usize)>)>,
        env: &mut GraphEnv,
    ) -> Result<RunOutcome> {
        let mut tx_stage: Vec<(u16, Packet)> = Vec::new();

        // Route the offloaded packets out of the element they parked at.
        if let Some((node_idx, items)) = postproc {
            let node = &mut self.nodes[node_idx];
            let GraphNode { slot, out, .. } = node;
            let off = slot
                .offloadable_mut()
                .ok_or_else(|| Error::Graph("parked at a plain element".into()))?;
            for (pkt_idx, in_port) in items {
                let Some(pkt) = batch.get_mut(pkt_idx) else {
                    continue;
                };
                let disp = off.postproc(in_port, pkt);
                route(disp, pkt_idx, out, &mut inputs, &mut batch, &mut tx_stage, env);
            }
        }

        for pos in start_pos..self.order.len() {
            let node_idx = self.order[pos];
            let mut list = std::mem::take(&mut inputs[node_idx]);
            if list.is_empty() {
                continue;
            }

            if self.nodes[node_idx].slot.is_offloadable() && env.offload.is_some() {
                match self.try_offload(node_idx, &mut batch, &list, env)? {
                    OffloadAttempt::Parked {
                        task_id,
                        items,
                        cctx,
                        datablocks,
                    } => {
                        batch.pending_offloads = items.len();
                        self.flush_tx(tx_stage, env);
                        let parked = ParkedTask {
                            batch,
                            inputs,
                            node_topo_pos: pos,
                            items,
                            cctx,
                            datablocks,
                        };
                        return Ok(RunOutcome::Parked { task_id, parked });
                    }
                    OffloadAttempt::Fallback(kept) => list = kept,
                }
            }

            let node = &mut self.nodes[node_idx];
            let GraphNode { slot, out, .. } = node;
            for (pkt_idx, in_port) in list {
                let Some(pkt) = batch.get_mut(pkt_idx) else {
                    continue;
                };
                let disp = slot.process(in_port, pkt);
                route(disp, pkt_idx, out, &mut inputs, &mut batch, &mut tx_stage, env);
            }
        }

        // Whatever never reached a sink leaves through the drop ring, so
        // the batch conserves packets.
        for pkt in batch.drain() {
            drop_packet(pkt, DropClass::Sw, env);
        }
        self.flush_tx(tx_stage, env);
        Ok(RunOutcome::Done)
    }

    fn try_offload(
        &mut self,
        node_idx: usize,
        batch: &mut PacketBatch,
        list: &[(usize, usize)],
        env: &mut GraphEnv,
    ) -> Result<OffloadAttempt> {
        let oenv = env.offload.as_mut().ok_or(Error::NoContext)?;
        let off = self.nodes[node_idx]
            .slot
            .offloadable_mut()
            .ok_or_else(|| Error::Graph("offload on a plain element".into()))?;

        let Some(arm) = off
            .offload_arms()
            .into_iter()
            .find(|a| a.kind == oenv.device_kind)
        else {
            return Ok(OffloadAttempt::Fallback(list.to_vec()));
        };
        if oenv.cctx_pool.is_empty() {
            return Ok(OffloadAttempt::Fallback(list.to_vec()));
        }

        // Pre-validate every region so items stay aligned across the
        // element's datablocks; failures are malformed packets.
        let descs = off.datablocks();
        let mut items: Vec<(usize, usize)> = Vec::with_capacity(list.len());
        let mut bad: Vec<usize> = Vec::new();
        for &(pkt_idx, in_port) in list {
            let Some(pkt) = batch.get(pkt_idx) else {
                continue;
            };
            if descs.iter().all(|d| roi_check(d, pkt)) {
                items.push((pkt_idx, in_port));
            } else {
                bad.push(pkt_idx);
            }
        }
        for pkt_idx in bad {
            if let Some(pkt) = batch.take(pkt_idx) {
                drop_packet(pkt, DropClass::Invalid, env);
            }
        }
        let oenv = env.offload.as_mut().ok_or(Error::NoContext)?;
        if items.is_empty() {
            return Ok(OffloadAttempt::Fallback(Vec::new()));
        }

        let cctx = oenv.cctx_pool.pop().ok_or(Error::NoContext)?;
        let off = self.nodes[node_idx]
            .slot
            .offloadable_mut()
            .ok_or_else(|| Error::Graph("offload on a plain element".into()))?;
        let indices: Vec<usize> = items.iter().map(|(i, _)| *i).collect();

        let mut prepared = Vec::with_capacity(descs.len());
        let mut args = Vec::new();
        let staged = (|| -> Result<()> {
            let mut guard = cctx.lock();
            guard.begin_task()?;
            let (input, output) = guard.regions();
            for desc in &descs {
                let id = oenv
                    .registry
                    .id_of(desc.name)
                    .ok_or_else(|| Error::Graph(format!("datablock '{}' unregistered", desc.name)))?;
                let (prep, skipped) =
                    prepare_datablock(desc, id, batch, &indices, input, output)?;
                debug_assert!(skipped.is_empty());
                prepared.push(prep);
            }
            off.stage_args(&oenv.nls, &mut args)?;
            Ok(())
        })();
        if let Err(e) = staged {
            warn!("offload staging failed, using CPU path: {}", e);
            oenv.cctx_pool.push(cctx);
            return Ok(OffloadAttempt::Fallback(items));
        }

        let task_id = oenv.next_task_id;
        oenv.next_task_id += 1;
        let datablocks = Arc::new(prepared);
        let task = OffloadTask {
            task_id,
            cctx: Arc::clone(&cctx),
            kernel: arm.kernel.clone(),
            res: ResourceParam::for_items(items.len(), arm.workgroup_size),
            args,
            datablocks: Arc::clone(&datablocks),
            completion_ring: Arc::clone(&oenv.completion_ring),
        };
        match oenv.task_ring.try_enqueue(task) {
            Ok(()) => Ok(OffloadAttempt::Parked {
                task_id,
                items,
                cctx,
                datablocks,
            }),
            Err(RingFull(_task)) => {
                warn!("task-input ring full, using CPU path");
                oenv.cctx_pool.push(cctx);
                Ok(OffloadAttempt::Fallback(items))
            }
        }
    }

    /// Drain staged TX packets into the per-port rings, honoring
    /// backpressure.
    fn flush_tx(&self, tx_stage: Vec<(u16, Packet)>, env: &GraphEnv) {
        for (port, pkt) in tx_stage {
            let Some(ring) = env.tx_rings.get(port as usize) else {
                drop_packet(pkt, DropClass::Invalid, env);
                continue;
            };
            if env.preserve_latency && ring.above_high_water() {
                env.stats.port(port).sw_drop.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                drop_to_ring(pkt, env);
                continue;
            }
            if let Err(RingFull(pkt)) = ring.try_enqueue(pkt) {
                env.stats.port(port).sw_drop.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                drop_to_ring(pkt, env);
            }
        }
    }
}

fn route(
    disp: Disposition,
    pkt_idx: usize,
    out: &[PortTarget],
    inputs: &mut [Vec<(usize, usize)>],
    batch: &mut PacketBatch,
    tx_stage: &mut Vec<(u16, Packet)>,
    env: &GraphEnv,
) {
    match disp {
        Disposition::Pass(port) => match out.get(port) {
            Some(PortTarget::Element { idx, in_port }) => {
                inputs[*idx].push((pkt_idx, *in_port));
            }
            Some(PortTarget::TxPort(tx)) => {
                if let Some(pkt) = batch.take(pkt_idx) {
                    tx_stage.push((*tx, pkt));
                }
            }
            None => {
                warn!(port, "disposition names a nonexistent output port");
                if let Some(pkt) = batch.take(pkt_idx) {
                    drop_packet(pkt, DropClass::Invalid, env);
                }
            }
        },
        Disposition::Drop => {
            if let Some(pkt) = batch.take(pkt_idx) {
                drop_packet(pkt, DropClass::Sw, env);
            }
        }
        Disposition::SlowPath => {
            if let Some(pkt) = batch.take(pkt_idx) {
                drop_packet(pkt, DropClass::SlowPath, env);
            }
        }
        Disposition::Pending => {
            // Only the offload machinery may park packets.
            warn!("plain element returned Pending");
            if let Some(pkt) = batch.take(pkt_idx) {
                drop_packet(pkt, DropClass::Invalid, env);
            }
        }
    }
}

fn drop_packet(pkt: Packet, class: DropClass, env: &GraphEnv) {
    use std::sync::atomic::Ordering;
    let stats = env.stats.port(pkt.port());
    match class {
        DropClass::Sw => stats.sw_drop.fetch_add(1, Ordering::Relaxed),
        DropClass::Invalid => stats.invalid.fetch_add(1, Ordering::Relaxed),
        DropClass::SlowPath => {
            stats.slow_path.fetch_add(1, Ordering::Relaxed);
            stats.sw_drop.fetch_add(1, Ordering::Relaxed)
        }
    };
    drop_to_ring(pkt, env);
}

fn drop_to_ring(pkt: Packet, env: &GraphEnv) {
    // A full drop ring destroys the packet in place; the pool buffer
    // still returns through its RAII handle.
    let _ = env.drop_ring.try_enqueue(pkt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pktgraph_core::{PacketPool, ProducerMode};

    fn ctx() -> ConfigContext {
        ConfigContext {
            num_ports: 2,
            node_id: 0,
        }
    }

    fn cpu_env() -> GraphEnv {
        GraphEnv {
            tx_rings: vec![
                Arc::new(Ring::new(64, ProducerMode::Single)),
                Arc::new(Ring::new(64, ProducerMode::Single)),
            ],
            drop_ring: Arc::new(Ring::new(64, ProducerMode::Multi)),
            stats: Arc::new(NodeStats::new(0, 2)),
            preserve_latency: false,
            offload: None,
        }
    }

    fn batch_of(n: usize, port: u16) -> (PacketPool, PacketBatch) {
        let pool = PacketPool::new("g", 0, 256, 64).unwrap();
        let mut batch = PacketBatch::new(32, 0, 0);
        for i in 0..n {
            let mut payload = vec![0u8; 60];
            payload[14] = i as u8;
            batch
                .push(Packet::synthesize(&pool, &payload, port).unwrap())
                .unwrap();
        }
        (pool, batch)
    }

    fn build(pipeline: &str) -> ElementGraph {
        let cfg = PipelineConfig::parse(pipeline).unwrap();
        ElementGraph::build(&cfg, &ctx()).unwrap()
    }

    #[test]
    fn test_build_rejects_cycle() {
        let cfg = PipelineConfig::parse("a :: Identity; b :: Identity; a -> b; b -> a").unwrap();
        assert!(ElementGraph::build(&cfg, &ctx()).is_err());
    }

    #[test]
    fn test_build_rejects_unwired_output() {
        let cfg = PipelineConfig::parse("Identity").unwrap();
        assert!(ElementGraph::build(&cfg, &ctx()).is_err());
    }

    #[test]
    fn test_build_rejects_double_wiring() {
        let cfg =
            PipelineConfig::parse("a :: FromDevice(0); a -> Discard; a -> Discard").unwrap();
        assert!(ElementGraph::build(&cfg, &ctx()).is_err());
    }

    #[test]
    fn test_build_rejects_bad_port() {
        let cfg = PipelineConfig::parse("a :: FromDevice(0); a[3] -> Discard").unwrap();
        assert!(ElementGraph::build(&cfg, &ctx()).is_err());
    }

    #[test]
    fn test_discard_counts_drops() {
        let mut graph = build("FromDevice(0) -> Discard");
        let mut env = cpu_env();
        let (_pool, batch) = batch_of(5, 0);
        match graph.run_batch(batch, &mut env).unwrap() {
            RunOutcome::Done => {}
            RunOutcome::Parked { .. } => panic!("nothing offloads here"),
        }
        assert_eq!(env.stats.snapshot(0).sw_drop, 5);
        assert_eq!(env.drop_ring.len(), 5);
        assert_eq!(env.tx_rings[0].len(), 0);
    }

    #[test]
    fn test_tx_order_matches_batch_order() {
        let mut graph = build("FromDevice(0) -> Identity -> ToDevice(1)");
        let mut env = cpu_env();
        let (_pool, batch) = batch_of(8, 0);
        graph.run_batch(batch, &mut env).unwrap();
        for i in 0..8 {
            let pkt = env.tx_rings[1].try_dequeue().unwrap();
            assert_eq!(pkt.data()[14], i as u8);
        }
    }

    #[test]
    fn test_root_filter_drops_foreign_ports() {
        let mut graph = build("FromDevice(0) -> ToDevice(1)");
        let mut env = cpu_env();
        // Packets arriving on port 1 never match the FromDevice(0) root.
        let (_pool, batch) = batch_of(3, 1);
        graph.run_batch(batch, &mut env).unwrap();
        assert_eq!(env.tx_rings[1].len(), 0);
        assert_eq!(env.stats.snapshot(1).sw_drop, 3);
    }

    #[test]
    fn test_tx_ring_overflow_counts_sw_drop() {
        let mut graph = build("FromDevice(0) -> ToDevice(0)");
        let mut env = cpu_env();
        env.tx_rings[0] = Arc::new(Ring::new(4, ProducerMode::Single));
        let (_pool, batch) = batch_of(8, 0);
        graph.run_batch(batch, &mut env).unwrap();
        assert_eq!(env.tx_rings[0].len(), 4);
        assert_eq!(env.stats.snapshot(0).sw_drop, 4);
    }

    #[test]
    fn test_preserve_latency_drops_at_high_water() {
        let mut graph = build("FromDevice(0) -> ToDevice(0)");
        let mut env = cpu_env();
        env.preserve_latency = true;
        env.tx_rings[0] = Arc::new(Ring::with_high_water(8, ProducerMode::Single, 4));
        let (_pool, batch) = batch_of(8, 0);
        graph.run_batch(batch, &mut env).unwrap();
        // Once the mark is reached nothing more is queued.
        assert_eq!(env.tx_rings[0].len(), 4);
        assert_eq!(env.stats.snapshot(0).sw_drop, 4);
    }
}
