//! The orchestrator: process lock, bring-up ladder, thread spawn/join.
//!
//! Initialization is a strict sequence whose steps are separated by
//! barriers, so every worker thread sees fully-initialized state at first
//! touch:
//!
//! ```text
//! [main]                        [comp]               [coproc]               [io]
//! acquire process lock          .                    .                      .
//! driver bring-up, port init    .                    .                      .
//! create rings + watchers       .                    .                      .
//! spawn coproc threads -------------------------------+                     .
//! :                             .                    init loop & device     .
//! create node-local storage     .                    :                      .
//! build element graphs          .                    :                      .
//! init graphs (global)          .                    :                      .
//! init graphs (per-node)        .                    :                      .
//! :                             .                    init offloadables      .
//! init graphs (per-thread)      .                    :                      .
//! release loop-start ----------------------------------+                    .
//! spawn comp threads -----------+                     :                     .
//! spawn io threads ----------------------------------------------------------+
//! (steady state)
//! ```

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, info};

use crate::comp::CompThread;
use crate::coproc::{CoprocThread, OffloadInitCell};
use crate::element::ConfigContext;
use crate::graph::{ElementGraph, GraphEnv, OffloadEnv};
use crate::io::{IoThread, PacketDriver, PacketRequest, PortQueueConf};
use crate::stats::NodeStats;
use crate::task::{InFlightMap, OffloadTask, TaskCompletion};
use pktgraph_cpu::EmulatedDevice;
use pktgraph_core::{
    ComputeDevice, CountedBarrier, DatablockRegistry, DeviceKind, Error, Location,
    NodeLocalStorage, Packet, PacketBatch, PacketPool, PipelineConfig, ProducerMode, Ring, Result,
    SharedContext, SystemConfig, Topology, Watcher,
};

/// Run-wide options from the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Prefer dropping over queueing under TX backpressure.
    pub preserve_latency: bool,
    /// Override the process-lock directory (tests).
    pub lock_dir: Option<PathBuf>,
}

/// Singleton file lock; presence of a live holder aborts startup.
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the lock, clearing stale files left by dead processes.
    pub fn acquire(name: &str, dir: Option<&Path>) -> Result<Self> {
        let dir = dir.map(PathBuf::from).unwrap_or_else(default_lock_dir);
        let path = dir.join(format!("{}.pid", name));
        if path.exists() {
            let holder = fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            if let Some(pid) = holder {
                if Path::new(&format!("/proc/{}", pid)).exists() {
                    return Err(Error::LockCollision);
                }
            }
            debug!(path = %path.display(), "removing stale process lock");
            let _ = fs::remove_file(&path);
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|_| Error::LockCollision)?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { path })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn default_lock_dir() -> PathBuf {
    // Root uses the system run directory, regular users the temp dir.
    if unsafe { libc::geteuid() } == 0 {
        PathBuf::from("/var/run")
    } else {
        std::env::temp_dir()
    }
}

#[cfg(not(unix))]
fn default_lock_dir() -> PathBuf {
    std::env::temp_dir()
}

const PACKET_BUF_SIZE: usize = 2048;
const SWRX_RING_LEN: usize = 32;
const REQUEST_RING_LEN: usize = 512;

/// A running pktgraph instance.
pub struct System {
    driver: Arc<dyn PacketDriver>,
    node_stats: Vec<Arc<NodeStats>>,
    io_threads: Vec<(Arc<Watcher>, JoinHandle<()>)>,
    comp_threads: Vec<(Arc<Watcher>, JoinHandle<()>)>,
    coproc_threads: Vec<(Arc<Watcher>, JoinHandle<()>)>,
    _lock: ProcessLock,
}

impl System {
    /// Execute the bring-up ladder and start every thread tier.
    pub fn launch(
        driver: Arc<dyn PacketDriver>,
        sys_cfg: &SystemConfig,
        pipe_cfg: &PipelineConfig,
        topo: &Topology,
        opts: RunOptions,
    ) -> Result<Self> {
        let lock = ProcessLock::acquire("pktgraph", opts.lock_dir.as_deref())?;
        info!("process lock acquired");

        let num_ports = driver.num_ports();
        if num_ports == 0 {
            return Err(Error::Driver("no available ports".into()));
        }
        info!(ports = num_ports, "driver up");
        sys_cfg.validate()?;

        let num_rxq = sys_cfg.param("NUM_RXQ_PER_PORT") as usize;
        let rx_desc = sys_cfg.param("IO_DESC_PER_HWRXQ") as usize;
        let tx_desc = sys_cfg.param("IO_DESC_PER_HWTXQ") as usize;
        let io_batch = (sys_cfg.param("IO_BATCH_SIZE") as usize).max(1);
        let comp_batch = (sys_cfg.param("COMP_BATCH_SIZE") as usize).max(1);
        let ppdepth = sys_cfg.param("COPROC_PPDEPTH") as usize;
        let taskin_len = sys_cfg.param("COPROC_INPUTQ_LENGTH") as usize;
        let taskout_len = sys_cfg.param("COPROC_COMPLETIONQ_LENGTH") as usize;
        let ctx_per_comp = sys_cfg.param("COPROC_CTX_PER_COMPTHREAD") as usize;
        let batchpool = sys_cfg.param("BATCHPOOL_SIZE") as usize;

        // Port bring-up: queues, three mempools per RX queue, start.
        let mut rss_key = [0u8; 40];
        rand::thread_rng().fill_bytes(&mut rss_key);
        let mut rx_pools: Vec<Vec<PacketPool>> = Vec::with_capacity(num_ports);
        for port in 0..num_ports as u16 {
            let info = driver.port_info(port)?;
            let conf = PortQueueConf {
                rx_queues: num_rxq,
                tx_queues: sys_cfg.io_threads.len().max(1),
                rx_desc,
                tx_desc,
                rss_key,
            };
            driver.configure_port(port, &conf)?;
            if !info.link_up {
                return Err(Error::Driver(format!("port {} link is down", port)));
            }
            let mut pools = Vec::with_capacity(num_rxq);
            for q in 0..num_rxq {
                let name = format!("pktbuf_n{}_d{}_r{}", info.node_id, port, q);
                pools.push(PacketPool::new(
                    name,
                    info.node_id,
                    PACKET_BUF_SIZE,
                    rx_desc + batchpool,
                )?);
            }
            rx_pools.push(pools);
            driver.start_port(port)?;
            driver.set_promiscuous(port, true);
            info!(port, mac = ?info.mac, node = info.node_id, "port enabled");
        }

        // Cross-tier rings and their watchers, one per queue declaration.
        let mut swrx_rings: Vec<Option<Arc<Ring<PacketBatch>>>> = Vec::new();
        let mut taskin_rings: Vec<Option<Arc<Ring<OffloadTask>>>> = Vec::new();
        let mut taskout_rings: Vec<Option<Arc<Ring<TaskCompletion>>>> = Vec::new();
        let mut watchers: Vec<Arc<Watcher>> = Vec::new();
        for conf in &sys_cfg.queues {
            let watcher = Watcher::new();
            swrx_rings.push(None);
            taskin_rings.push(None);
            taskout_rings.push(None);
            let idx = watchers.len();
            match conf.template {
                pktgraph_core::config::QueueTemplate::SwRx => {
                    let ring = Arc::new(Ring::new(SWRX_RING_LEN, ProducerMode::Multi));
                    ring.attach_watcher(Arc::clone(&watcher));
                    swrx_rings[idx] = Some(ring);
                }
                pktgraph_core::config::QueueTemplate::TaskIn => {
                    let ring = Arc::new(Ring::new(taskin_len, ProducerMode::Multi));
                    ring.attach_watcher(Arc::clone(&watcher));
                    taskin_rings[idx] = Some(ring);
                }
                pktgraph_core::config::QueueTemplate::TaskOut => {
                    let ring = Arc::new(Ring::new(taskout_len, ProducerMode::Single));
                    ring.attach_watcher(Arc::clone(&watcher));
                    taskout_rings[idx] = Some(ring);
                }
            }
            watchers.push(watcher);
        }

        // Per-node counters.
        let node_stats: Vec<Arc<NodeStats>> = (0..topo.num_nodes())
            .map(|n| Arc::new(NodeStats::new(n, num_ports)))
            .collect();

        // Spawn coprocessor threads one by one, each serialized on its
        // init-done barrier. Computation contexts are split off first so
        // they can be handed to the computation tier later.
        let mut coproc_threads = Vec::new();
        let mut coproc_cells: Vec<Option<CoprocRendezvous>> =
            (0..topo.num_nodes()).map(|_| None).collect();
        let mut node_cctx_pools: Vec<Vec<SharedContext>> = vec![Vec::new(); topo.num_nodes()];
        for conf in &sys_cfg.coproc_threads {
            let node_id = topo.node_of_core(conf.core_id);
            let comp_on_node = sys_cfg
                .comp_threads
                .iter()
                .filter(|c| topo.node_of_core(c.core_id) == node_id)
                .count();
            let mut device = Box::new(EmulatedDevice::new(
                node_id,
                ctx_per_comp * comp_on_node + 2,
            ));
            for _ in 0..ctx_per_comp * comp_on_node {
                if let Some(cctx) = device.get_available_context() {
                    node_cctx_pools[node_id].push(cctx);
                }
            }

            let term = Watcher::new();
            let rendezvous = CoprocRendezvous {
                offload_init: Arc::new(CountedBarrier::new(1)),
                offload_init_done: Arc::new(CountedBarrier::new(1)),
                loopstart: Arc::new(CountedBarrier::new(1)),
                cell: Arc::new(Mutex::new(OffloadInitCell::default())),
                nls: Arc::new(NodeLocalStorage::new(node_id)),
                device_kind: DeviceKind::Emulated,
            };
            let init_done = Arc::new(CountedBarrier::new(1));
            let task_ring = taskin_rings[conf.taskinq_idx]
                .clone()
                .ok_or_else(|| Error::Config("coproc taskinq is not a taskin queue".into()))?;
            let thread = CoprocThread {
                loc: Location {
                    node_id,
                    core_id: conf.core_id,
                    local_thread_idx: 0,
                    global_thread_idx: coproc_threads.len(),
                },
                device,
                task_ring,
                input_watcher: Arc::clone(&watchers[conf.taskinq_idx]),
                term: Arc::clone(&term),
                ppdepth,
                nls: Arc::clone(&rendezvous.nls),
                init_done: Arc::clone(&init_done),
                offload_init: Arc::clone(&rendezvous.offload_init),
                offload_init_done: Arc::clone(&rendezvous.offload_init_done),
                loopstart: Arc::clone(&rendezvous.loopstart),
                init_cell: Arc::clone(&rendezvous.cell),
            };
            let handle = std::thread::Builder::new()
                .name(format!("coproc{}", node_id))
                .spawn(move || thread.run())
                .map_err(|e| Error::Thread(e.to_string()))?;
            init_done.wait();
            coproc_cells[node_id] = Some(rendezvous);
            coproc_threads.push((term, handle));
        }
        info!(count = coproc_threads.len(), "coprocessor threads spawned");

        // Node-local storage for nodes that have no coprocessor.
        let mut node_nls: Vec<Arc<NodeLocalStorage>> = (0..topo.num_nodes())
            .map(|n| Arc::new(NodeLocalStorage::new(n)))
            .collect();
        for (node_id, cell) in coproc_cells.iter().enumerate() {
            if let Some(r) = cell {
                node_nls[node_id] = Arc::clone(&r.nls);
            }
        }

        // Build one element graph per computation thread.
        let mut graphs: Vec<ElementGraph> = Vec::with_capacity(sys_cfg.comp_threads.len());
        let mut comp_nodes: Vec<usize> = Vec::with_capacity(sys_cfg.comp_threads.len());
        for conf in &sys_cfg.comp_threads {
            let node_id = topo.node_of_core(conf.core_id);
            let ctx = ConfigContext {
                num_ports,
                node_id,
            };
            graphs.push(ElementGraph::build(pipe_cfg, &ctx)?);
            comp_nodes.push(node_id);
        }
        if graphs.is_empty() {
            return Err(Error::Config("no computation threads configured".into()));
        }

        // Datablock registry comes from the first context's elements.
        let mut registry = DatablockRegistry::new();
        graphs[0].register_datablocks(&mut registry)?;
        let registry = Arc::new(registry);
        debug!(datablocks = registry.len(), "datablock registry built");

        // Four-phase element init, phases strictly ordered.
        graphs[0].initialize_global()?;
        let mut node_initialized = vec![false; topo.num_nodes()];
        for (graph, &node_id) in graphs.iter_mut().zip(&comp_nodes) {
            if !node_initialized[node_id] {
                graph.initialize_per_node(&node_nls[node_id])?;
                node_initialized[node_id] = true;
            }
        }
        for node_id in 0..topo.num_nodes() {
            let Some(rendezvous) = &coproc_cells[node_id] else {
                continue;
            };
            let Some(pos) = comp_nodes.iter().position(|&n| n == node_id) else {
                // No computation thread on this node: nothing to init,
                // but the thread still waits on the rendezvous.
                rendezvous.offload_init.proceed();
                rendezvous.offload_init_done.wait();
                continue;
            };
            info!(node = node_id, "initializing offloadables on coprocessor");
            let graph = graphs.remove(pos);
            rendezvous.cell.lock().graph = Some(graph);
            rendezvous.offload_init.proceed();
            rendezvous.offload_init_done.wait();
            let mut cell = rendezvous.cell.lock();
            if let Some(e) = cell.error.take() {
                return Err(e);
            }
            let graph = cell
                .graph
                .take()
                .ok_or_else(|| Error::Thread("offload init lost the graph".into()))?;
            drop(cell);
            graphs.insert(pos, graph);
        }
        for (graph, &node_id) in graphs.iter_mut().zip(&comp_nodes) {
            graph.initialize(&node_nls[node_id])?;
        }
        info!("element graphs initialized");

        // Let the coprocessor loops run.
        for rendezvous in coproc_cells.iter().flatten() {
            rendezvous.loopstart.proceed();
        }

        // I/O thread plumbing: per-port TX rings, drop ring, request ring.
        let mut io_plumbing: Vec<IoPlumbing> = Vec::with_capacity(sys_cfg.io_threads.len());
        for _conf in &sys_cfg.io_threads {
            let tx_len = 8 * comp_batch;
            let tx_rings: Vec<Arc<Ring<Packet>>> = (0..num_ports)
                .map(|_| {
                    Arc::new(Ring::with_high_water(
                        tx_len,
                        ProducerMode::Single,
                        tx_len - 16,
                    ))
                })
                .collect();
            io_plumbing.push(IoPlumbing {
                tx_rings,
                drop_ring: Arc::new(Ring::new(8 * comp_batch, ProducerMode::Multi)),
                request_ring: Arc::new(Ring::new(REQUEST_RING_LEN, ProducerMode::Multi)),
            });
        }

        // Spawn computation threads.
        let mut comp_threads = Vec::new();
        let mut per_node_counts = vec![0usize; topo.num_nodes()];
        let mut cctx_cursor = vec![0usize; topo.num_nodes()];
        for (i, conf) in sys_cfg.comp_threads.iter().enumerate() {
            let node_id = comp_nodes[i];
            let graph = graphs.remove(0);
            let io_idx = sys_cfg
                .io_threads
                .iter()
                .position(|io| io.swrxq_idx == conf.swrxq_idx)
                .ok_or_else(|| Error::Config("computation thread has no paired io thread".into()))?;

            let offload = match (conf.taskinq_idx, conf.taskoutq_idx) {
                (Some(tin), Some(tout)) => {
                    let rendezvous = coproc_cells[node_id].as_ref().ok_or_else(|| {
                        Error::Config(format!("node {} offloads without a coprocessor", node_id))
                    })?;
                    let completion_ring = taskout_rings[tout]
                        .clone()
                        .ok_or_else(|| Error::Config("taskoutq is not a taskout queue".into()))?;
                    let mut cctx_pool = Vec::with_capacity(ctx_per_comp);
                    for _ in 0..ctx_per_comp {
                        let cur = cctx_cursor[node_id];
                        if let Some(cctx) = node_cctx_pools[node_id].get(cur) {
                            cctx_pool.push(Arc::clone(cctx));
                            cctx_cursor[node_id] += 1;
                        }
                    }
                    Some(OffloadEnv {
                        device_kind: rendezvous.device_kind,
                        task_ring: taskin_rings[tin]
                            .clone()
                            .ok_or_else(|| Error::Config("taskinq is not a taskin queue".into()))?,
                        completion_ring,
                        cctx_pool,
                        registry: Arc::clone(&registry),
                        nls: Arc::clone(&node_nls[node_id]),
                        next_task_id: 1,
                    })
                }
                _ => None,
            };

            let term = Watcher::new();
            let thread = CompThread {
                loc: Location {
                    node_id,
                    core_id: conf.core_id,
                    local_thread_idx: per_node_counts[node_id],
                    global_thread_idx: i,
                },
                graph,
                swrx: swrx_rings[conf.swrxq_idx]
                    .clone()
                    .ok_or_else(|| Error::Config("swrxq is not a swrx queue".into()))?,
                rx_watcher: Arc::clone(&watchers[conf.swrxq_idx]),
                completion_ring: offload.as_ref().map(|o| Arc::clone(&o.completion_ring)),
                completion_watcher: conf.taskoutq_idx.map(|t| Arc::clone(&watchers[t])),
                term: Arc::clone(&term),
                env: GraphEnv {
                    tx_rings: io_plumbing[io_idx].tx_rings.clone(),
                    drop_ring: Arc::clone(&io_plumbing[io_idx].drop_ring),
                    stats: Arc::clone(&node_stats[node_id]),
                    preserve_latency: opts.preserve_latency,
                    offload,
                },
                in_flight: InFlightMap::new(ctx_per_comp.max(1) * 2),
                drain_quota: comp_batch.max(1),
            };
            per_node_counts[node_id] += 1;
            let handle = std::thread::Builder::new()
                .name(format!("comp{}", i))
                .spawn(move || thread.run())
                .map_err(|e| Error::Thread(e.to_string()))?;
            comp_threads.push((term, handle));
        }
        info!(count = comp_threads.len(), "computation threads spawned");

        // Spawn I/O threads; the first on each node is the node master.
        let mut io_threads = Vec::new();
        let mut io_node_counts = vec![0usize; topo.num_nodes()];
        for (i, conf) in sys_cfg.io_threads.iter().enumerate() {
            let node_id = topo.node_of_core(conf.core_id);
            let plumbing = &io_plumbing[i];
            let paired_comp = sys_cfg
                .comp_threads
                .iter()
                .position(|c| c.swrxq_idx == conf.swrxq_idx)
                .unwrap_or(0);
            let pools: Vec<PacketPool> = conf
                .attached_rxqs
                .iter()
                .map(|(port, q)| rx_pools[*port as usize][*q as usize].clone())
                .collect();
            let newpkt_pool = PacketPool::new(
                format!("newbuf_n{}_t{}", node_id, i),
                node_id,
                PACKET_BUF_SIZE,
                batchpool.max(64),
            )?;
            let term = Watcher::new();
            let thread = IoThread {
                loc: Location {
                    node_id,
                    core_id: conf.core_id,
                    local_thread_idx: io_node_counts[node_id],
                    global_thread_idx: i,
                },
                driver: Arc::clone(&driver),
                rx_queues: conf.attached_rxqs.clone(),
                rx_pools: pools,
                newpkt_pool,
                swrx: swrx_rings[conf.swrxq_idx]
                    .clone()
                    .ok_or_else(|| Error::Config("swrxq is not a swrx queue".into()))?,
                tx_rings: plumbing.tx_rings.clone(),
                drop_ring: Arc::clone(&plumbing.drop_ring),
                request_ring: Arc::clone(&plumbing.request_ring),
                term: Arc::clone(&term),
                stats: Arc::clone(&node_stats[node_id]),
                io_batch_size: io_batch,
                comp_batch_size: comp_batch,
                owner_comp: paired_comp,
                node_master: io_node_counts[node_id] == 0,
            };
            io_node_counts[node_id] += 1;
            let handle = std::thread::Builder::new()
                .name(format!("io{}", i))
                .spawn(move || thread.run())
                .map_err(|e| Error::Thread(e.to_string()))?;
            io_threads.push((term, handle));
        }
        info!(count = io_threads.len(), "io threads spawned, running");

        Ok(Self {
            driver,
            node_stats,
            io_threads,
            comp_threads,
            coproc_threads,
            _lock: lock,
        })
    }

    /// The driver the system was launched with.
    pub fn driver(&self) -> &Arc<dyn PacketDriver> {
        &self.driver
    }

    /// Counters of one node.
    pub fn stats(&self, node_id: usize) -> Arc<NodeStats> {
        Arc::clone(&self.node_stats[node_id])
    }

    /// Graceful shutdown: stop feeders first, drain workers, join
    /// everything, report counters once.
    pub fn stop(self) -> Result<()> {
        info!("terminating");
        join_tier(self.io_threads, "io")?;
        join_tier(self.comp_threads, "comp")?;
        join_tier(self.coproc_threads, "coproc")?;
        for stats in &self.node_stats {
            stats.report();
        }
        info!("terminated");
        Ok(())
    }
}

struct CoprocRendezvous {
    offload_init: Arc<CountedBarrier>,
    offload_init_done: Arc<CountedBarrier>,
    loopstart: Arc<CountedBarrier>,
    cell: Arc<Mutex<OffloadInitCell>>,
    nls: Arc<NodeLocalStorage>,
    device_kind: DeviceKind,
}

struct IoPlumbing {
    tx_rings: Vec<Arc<Ring<Packet>>>,
    drop_ring: Arc<Ring<Packet>>,
    request_ring: Arc<Ring<PacketRequest>>,
}

fn join_tier(tier: Vec<(Arc<Watcher>, JoinHandle<()>)>, name: &str) -> Result<()> {
    for (term, _) in &tier {
        term.signal();
    }
    for (_, handle) in tier {
        handle
            .join()
            .map_err(|_| Error::Thread(format!("{} thread panicked", name)))?;
    }
    debug!(tier = name, "joined");
    Ok(())
}
