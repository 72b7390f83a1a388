//! Poll-mode I/O: the driver contract and the per-core I/O thread.
//!
//! The NIC driver is an external collaborator; [`PacketDriver`] fixes the
//! burst API the runtime programs against. [`LoopbackDriver`] is the
//! in-process implementation the tests and the smoke path use: injected
//! frames come back out of `burst_rx`, transmitted frames are captured
//! per port.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::stats::NodeStats;
use pktgraph_core::{
    bind_current_thread, Error, Location, Packet, PacketBatch, PacketPool, Result, Ring, RingFull,
    Watcher,
};

/// Static facts about one port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port MAC address.
    pub mac: [u8; 6],
    /// NUMA node the port's PCIe slot hangs off.
    pub node_id: usize,
    /// Link state at query time.
    pub link_up: bool,
    /// Hardware RX queue limit.
    pub max_rx_queues: usize,
    /// Hardware TX queue limit.
    pub max_tx_queues: usize,
}

/// Per-port queue setup handed to the driver at bring-up.
#[derive(Debug, Clone)]
pub struct PortQueueConf {
    /// RX queues to create.
    pub rx_queues: usize,
    /// TX queues to create.
    pub tx_queues: usize,
    /// Descriptors per hardware RX queue.
    pub rx_desc: usize,
    /// Descriptors per hardware TX queue.
    pub tx_desc: usize,
    /// RSS hash key programmed into the NIC.
    pub rss_key: [u8; 40],
}

/// Outcome of one RX burst.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxBurst {
    /// Packets delivered into the output vector.
    pub received: usize,
    /// Frames lost because the mempool was exhausted.
    pub dropped: usize,
}

/// Burst-mode NIC driver contract.
pub trait PacketDriver: Send + Sync {
    /// Number of ports the driver discovered.
    fn num_ports(&self) -> usize;

    /// Facts about one port.
    fn port_info(&self, port: u16) -> Result<PortInfo>;

    /// Create the port's hardware queues.
    fn configure_port(&self, port: u16, conf: &PortQueueConf) -> Result<()>;

    /// Start RX/TX processing.
    fn start_port(&self, port: u16) -> Result<()>;

    /// Toggle promiscuous mode.
    fn set_promiscuous(&self, port: u16, enabled: bool);

    /// Receive up to `max` packets from one hardware queue, drawing
    /// buffers from `pool`.
    fn burst_rx(
        &self,
        port: u16,
        queue: u16,
        pool: &PacketPool,
        max: usize,
        out: &mut Vec<Packet>,
    ) -> RxBurst;

    /// Transmit the leading packets of `pkts`; consumed packets are
    /// removed, unsent ones stay for the next burst.
    fn burst_tx(&self, port: u16, queue: u16, pkts: &mut Vec<Packet>) -> usize;
}

const LOOPBACK_MAX_QUEUES: usize = 16;

struct LoopbackPort {
    mac: [u8; 6],
    node_id: usize,
    started: AtomicBool,
    promiscuous: AtomicBool,
    rx: Vec<Mutex<VecDeque<Vec<u8>>>>,
    tx: Mutex<Vec<Vec<u8>>>,
    tx_stalled: AtomicBool,
}

/// In-process driver: frames injected per (port, queue) come back out of
/// `burst_rx`; `burst_tx` captures frames per port and can be stalled to
/// exercise backpressure.
pub struct LoopbackDriver {
    ports: Vec<LoopbackPort>,
}

impl LoopbackDriver {
    /// Driver with `num_ports` ports on node 0.
    pub fn new(num_ports: usize) -> Self {
        let ports = (0..num_ports)
            .map(|p| LoopbackPort {
                mac: [0x02, 0, 0, 0, 0, p as u8],
                node_id: 0,
                started: AtomicBool::new(false),
                promiscuous: AtomicBool::new(false),
                rx: (0..LOOPBACK_MAX_QUEUES)
                    .map(|_| Mutex::new(VecDeque::new()))
                    .collect(),
                tx: Mutex::new(Vec::new()),
                tx_stalled: AtomicBool::new(false),
            })
            .collect();
        Self { ports }
    }

    /// Queue a frame for reception on (port, queue).
    pub fn inject(&self, port: u16, queue: u16, frame: Vec<u8>) {
        if let Some(p) = self.ports.get(port as usize) {
            p.rx[queue as usize % LOOPBACK_MAX_QUEUES]
                .lock()
                .push_back(frame);
        }
    }

    /// Take every frame transmitted on a port so far.
    pub fn drain_tx(&self, port: u16) -> Vec<Vec<u8>> {
        self.ports
            .get(port as usize)
            .map(|p| std::mem::take(&mut *p.tx.lock()))
            .unwrap_or_default()
    }

    /// Frames transmitted on a port so far.
    pub fn tx_count(&self, port: u16) -> usize {
        self.ports
            .get(port as usize)
            .map(|p| p.tx.lock().len())
            .unwrap_or(0)
    }

    /// Stall or resume TX on a port (backpressure tests).
    pub fn stall_tx(&self, port: u16, stalled: bool) {
        if let Some(p) = self.ports.get(port as usize) {
            p.tx_stalled.store(stalled, Ordering::Release);
        }
    }

    /// Frames still waiting in a port's RX queues.
    pub fn rx_backlog(&self, port: u16) -> usize {
        self.ports
            .get(port as usize)
            .map(|p| p.rx.iter().map(|q| q.lock().len()).sum())
            .unwrap_or(0)
    }
}

impl PacketDriver for LoopbackDriver {
    fn num_ports(&self) -> usize {
        self.ports.len()
    }

    fn port_info(&self, port: u16) -> Result<PortInfo> {
        let p = self
            .ports
            .get(port as usize)
            .ok_or_else(|| Error::Driver(format!("port {} does not exist", port)))?;
        Ok(PortInfo {
            mac: p.mac,
            node_id: p.node_id,
            link_up: true,
            max_rx_queues: LOOPBACK_MAX_QUEUES,
            max_tx_queues: LOOPBACK_MAX_QUEUES,
        })
    }

    fn configure_port(&self, port: u16, conf: &PortQueueConf) -> Result<()> {
        let info = self.port_info(port)?;
        if conf.rx_queues > info.max_rx_queues {
            return Err(Error::Driver(format!(
                "port {} supports {} RX queues, {} requested",
                port, info.max_rx_queues, conf.rx_queues
            )));
        }
        if conf.tx_queues > info.max_tx_queues {
            return Err(Error::Driver(format!(
                "port {} supports {} TX queues, {} requested",
                port, info.max_tx_queues, conf.tx_queues
            )));
        }
        Ok(())
    }

    fn start_port(&self, port: u16) -> Result<()> {
        let p = self
            .ports
            .get(port as usize)
            .ok_or_else(|| Error::Driver(format!("port {} does not exist", port)))?;
        p.started.store(true, Ordering::Release);
        Ok(())
    }

    fn set_promiscuous(&self, port: u16, enabled: bool) {
        if let Some(p) = self.ports.get(port as usize) {
            p.promiscuous.store(enabled, Ordering::Release);
        }
    }

    fn burst_rx(
        &self,
        port: u16,
        queue: u16,
        pool: &PacketPool,
        max: usize,
        out: &mut Vec<Packet>,
    ) -> RxBurst {
        let Some(p) = self.ports.get(port as usize) else {
            return RxBurst::default();
        };
        if !p.started.load(Ordering::Acquire) {
            return RxBurst::default();
        }
        let mut queue_frames = p.rx[queue as usize % LOOPBACK_MAX_QUEUES].lock();
        let mut burst = RxBurst::default();
        while burst.received < max {
            let Some(frame) = queue_frames.pop_front() else {
                break;
            };
            let Some(mut buf) = pool.try_alloc() else {
                burst.dropped += 1;
                continue;
            };
            let len = frame.len().min(buf.len());
            buf.as_mut_slice()[..len].copy_from_slice(&frame[..len]);
            let mut pkt = Packet::from_rx(buf, len, port, queue);
            pkt.anno.set(pktgraph_core::AnnoSlot::IfaceIn, port as u64);
            out.push(pkt);
            burst.received += 1;
        }
        burst
    }

    fn burst_tx(&self, port: u16, _queue: u16, pkts: &mut Vec<Packet>) -> usize {
        let Some(p) = self.ports.get(port as usize) else {
            return 0;
        };
        if p.tx_stalled.load(Ordering::Acquire) {
            return 0;
        }
        let mut tx = p.tx.lock();
        let n = pkts.len();
        for pkt in pkts.drain(..) {
            tx.push(pkt.data().to_vec());
        }
        n
    }
}

/// Request record for packets synthesized on behalf of elements.
pub struct PacketRequest {
    /// Port the new packet leaves on.
    pub port: u16,
    /// Frame contents.
    pub payload: Vec<u8>,
}

/// One poll-mode I/O thread.
pub struct IoThread {
    /// Thread placement.
    pub loc: Location,
    /// The NIC driver.
    pub driver: Arc<dyn PacketDriver>,
    /// (port, queue) pairs this thread polls.
    pub rx_queues: Vec<(u16, u16)>,
    /// RX mempool per attached queue.
    pub rx_pools: Vec<PacketPool>,
    /// Pool for synthesized packets.
    pub newpkt_pool: PacketPool,
    /// SW-RX ring toward the paired computation thread.
    pub swrx: Arc<Ring<PacketBatch>>,
    /// Per-port TX rings this thread drains.
    pub tx_rings: Vec<Arc<Ring<Packet>>>,
    /// Drop ring this thread drains.
    pub drop_ring: Arc<Ring<Packet>>,
    /// New-packet request ring this thread services.
    pub request_ring: Arc<Ring<PacketRequest>>,
    /// Termination watcher.
    pub term: Arc<Watcher>,
    /// Node counters.
    pub stats: Arc<NodeStats>,
    /// Burst size for RX/TX.
    pub io_batch_size: usize,
    /// Capacity of the batches handed to computation.
    pub comp_batch_size: usize,
    /// Global index of the paired computation thread.
    pub owner_comp: usize,
    /// Whether this thread aggregates node counters.
    pub node_master: bool,
}

impl IoThread {
    /// Run the steady cycle until the termination watcher fires.
    pub fn run(self) {
        if let Err(e) = bind_current_thread(self.loc.core_id) {
            warn!(core = self.loc.core_id, "cpu pinning failed: {}", e);
        }
        info!(
            node = self.loc.node_id,
            core = self.loc.core_id,
            rx_queues = self.rx_queues.len(),
            master = self.node_master,
            "io thread up"
        );

        let mut next_batch_id: u64 = 0;
        let mut tx_pending: Vec<Vec<Packet>> = (0..self.tx_rings.len()).map(|_| Vec::new()).collect();
        let mut last_stat = Instant::now();

        loop {
            if self.term.take() {
                break;
            }
            let mut did_work = false;

            // (a)+(b) burst-RX each attached queue, batch, hand off.
            for qi in 0..self.rx_queues.len() {
                let (port, queue) = self.rx_queues[qi];
                let mut pkts = Vec::with_capacity(self.io_batch_size);
                let burst = self.driver.burst_rx(
                    port,
                    queue,
                    &self.rx_pools[qi],
                    self.io_batch_size,
                    &mut pkts,
                );
                if burst.received == 0 && burst.dropped == 0 {
                    continue;
                }
                did_work = true;
                use std::sync::atomic::Ordering::Relaxed;
                self.stats.port(port).recv.fetch_add(burst.received as u64, Relaxed);
                self.stats.port(port).rx_drop.fetch_add(burst.dropped as u64, Relaxed);

                let mut batch =
                    PacketBatch::new(self.comp_batch_size, self.owner_comp, next_batch_id);
                next_batch_id += 1;
                for pkt in pkts {
                    if let Err(pkt) = batch.push(pkt) {
                        let full = std::mem::replace(
                            &mut batch,
                            PacketBatch::new(self.comp_batch_size, self.owner_comp, next_batch_id),
                        );
                        next_batch_id += 1;
                        self.push_swrx(full);
                        let _ = batch.push(pkt);
                    }
                }
                if !batch.is_empty() {
                    trace!(port, queue, n = batch.len(), "rx batch");
                    self.push_swrx(batch);
                }
            }

            // (c) drain one TX ring per port.
            for port in 0..self.tx_rings.len() {
                let pending = &mut tx_pending[port];
                let room = self.io_batch_size.saturating_sub(pending.len());
                self.tx_rings[port].dequeue_burst(pending, room);
                if pending.is_empty() {
                    continue;
                }
                let sent = self.driver.burst_tx(port as u16, self.loc.core_id as u16, pending);
                if sent > 0 {
                    did_work = true;
                    self.stats
                        .port(port as u16)
                        .sent
                        .fetch_add(sent as u64, std::sync::atomic::Ordering::Relaxed);
                }
            }

            // (d) return dropped packets to their mempools.
            let mut drops = Vec::new();
            if self.drop_ring.dequeue_burst(&mut drops, 4 * self.io_batch_size) > 0 {
                did_work = true;
                drops.clear();
            }

            // (e) service new-packet requests.
            while let Ok(req) = self.request_ring.try_dequeue() {
                did_work = true;
                self.service_request(req);
            }

            // (f) node master samples counters.
            if self.node_master && last_stat.elapsed() >= Duration::from_secs(1) {
                self.stats.report();
                last_stat = Instant::now();
            }

            if !did_work {
                std::thread::yield_now();
            }
        }

        // Final drain: TX leftovers count as tx drops, the drop ring just
        // returns buffers.
        for (port, pending) in tx_pending.into_iter().enumerate() {
            if !pending.is_empty() {
                self.stats
                    .port(port as u16)
                    .tx_drop
                    .fetch_add(pending.len() as u64, std::sync::atomic::Ordering::Relaxed);
            }
        }
        let mut drops = Vec::new();
        while self.drop_ring.dequeue_burst(&mut drops, 64) > 0 {
            drops.clear();
        }
        debug!(node = self.loc.node_id, core = self.loc.core_id, "io thread down");
    }

    fn push_swrx(&self, batch: PacketBatch) {
        if let Err(RingFull(mut batch)) = self.swrx.try_enqueue(batch) {
            use std::sync::atomic::Ordering::Relaxed;
            for pkt in batch.drain() {
                self.stats.port(pkt.port()).sw_drop.fetch_add(1, Relaxed);
            }
        }
    }

    fn service_request(&self, req: PacketRequest) {
        let Some(pkt) = Packet::synthesize(&self.newpkt_pool, &req.payload, req.port) else {
            use std::sync::atomic::Ordering::Relaxed;
            self.stats.port(req.port).rx_drop.fetch_add(1, Relaxed);
            return;
        };
        if let Err(RingFull(pkt)) = self.tx_rings[req.port as usize % self.tx_rings.len().max(1)]
            .try_enqueue(pkt)
        {
            use std::sync::atomic::Ordering::Relaxed;
            self.stats.port(req.port).sw_drop.fetch_add(1, Relaxed);
            drop(pkt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_inject_and_rx() {
        let driver = LoopbackDriver::new(2);
        driver.start_port(0).unwrap();
        driver.inject(0, 0, vec![1, 2, 3, 4]);
        let pool = PacketPool::new("rx", 0, 2048, 8).unwrap();
        let mut out = Vec::new();
        let burst = driver.burst_rx(0, 0, &pool, 32, &mut out);
        assert_eq!(burst.received, 1);
        assert_eq!(out[0].data(), &[1, 2, 3, 4]);
        assert_eq!(out[0].port(), 0);
    }

    #[test]
    fn test_loopback_rx_before_start_is_empty() {
        let driver = LoopbackDriver::new(1);
        driver.inject(0, 0, vec![1]);
        let pool = PacketPool::new("rx", 0, 2048, 8).unwrap();
        let mut out = Vec::new();
        assert_eq!(driver.burst_rx(0, 0, &pool, 32, &mut out).received, 0);
    }

    #[test]
    fn test_loopback_pool_exhaustion_counts_drops() {
        let driver = LoopbackDriver::new(1);
        driver.start_port(0).unwrap();
        for _ in 0..4 {
            driver.inject(0, 0, vec![0u8; 60]);
        }
        let pool = PacketPool::new("rx", 0, 2048, 2).unwrap();
        let mut out = Vec::new();
        let burst = driver.burst_rx(0, 0, &pool, 32, &mut out);
        assert_eq!(burst.received, 2);
        assert_eq!(burst.dropped, 2);
    }

    #[test]
    fn test_loopback_tx_stall() {
        let driver = LoopbackDriver::new(1);
        let pool = PacketPool::new("tx", 0, 256, 8).unwrap();
        let mut pkts = vec![Packet::synthesize(&pool, &[9u8; 60], 0).unwrap()];
        driver.stall_tx(0, true);
        assert_eq!(driver.burst_tx(0, 0, &mut pkts), 0);
        assert_eq!(pkts.len(), 1);
        driver.stall_tx(0, false);
        assert_eq!(driver.burst_tx(0, 0, &mut pkts), 1);
        assert!(pkts.is_empty());
        assert_eq!(driver.tx_count(0), 1);
    }

    #[test]
    fn test_configure_port_queue_limit() {
        let driver = LoopbackDriver::new(1);
        let conf = PortQueueConf {
            rx_queues: 64,
            tx_queues: 1,
            rx_desc: 512,
            tx_desc: 512,
            rss_key: [0u8; 40],
        };
        assert!(driver.configure_port(0, &conf).is_err());
    }
}
