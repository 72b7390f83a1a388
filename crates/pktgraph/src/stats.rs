//! Per-port counters and their per-node aggregation.
//!
//! Counters are lock-free atomics bumped from any tier; the node-master
//! I/O thread samples them periodically and the orchestrator reports the
//! final totals at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one port.
#[derive(Default)]
pub struct PortStats {
    /// Packets received from the hardware queue.
    pub recv: AtomicU64,
    /// Packets handed to burst-TX.
    pub sent: AtomicU64,
    /// Packets dropped by software (full rings, element kills).
    pub sw_drop: AtomicU64,
    /// Packets lost because the RX mempool was exhausted.
    pub rx_drop: AtomicU64,
    /// Packets the driver could not transmit.
    pub tx_drop: AtomicU64,
    /// Malformed packets (failed region resolution, bad headers).
    pub invalid: AtomicU64,
    /// Packets routed to the reserved slow-path class.
    pub slow_path: AtomicU64,
}

/// Point-in-time copy of one port's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    /// Packets received.
    pub recv: u64,
    /// Packets sent.
    pub sent: u64,
    /// Software drops.
    pub sw_drop: u64,
    /// RX mempool drops.
    pub rx_drop: u64,
    /// TX drops.
    pub tx_drop: u64,
    /// Malformed packets.
    pub invalid: u64,
    /// Slow-path packets.
    pub slow_path: u64,
}

impl PortStats {
    fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            recv: self.recv.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            sw_drop: self.sw_drop.load(Ordering::Relaxed),
            rx_drop: self.rx_drop.load(Ordering::Relaxed),
            tx_drop: self.tx_drop.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            slow_path: self.slow_path.load(Ordering::Relaxed),
        }
    }
}

/// Counters for every port, owned by one NUMA node.
pub struct NodeStats {
    node_id: usize,
    ports: Vec<PortStats>,
}

impl NodeStats {
    /// Create zeroed counters for `num_ports` ports.
    pub fn new(node_id: usize, num_ports: usize) -> Self {
        Self {
            node_id,
            ports: (0..num_ports).map(|_| PortStats::default()).collect(),
        }
    }

    /// Owning node.
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    /// Number of ports tracked.
    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    /// Counters of one port. Out-of-range ports map to port 0 so a
    /// miscounted packet never panics the fast path.
    pub fn port(&self, port: u16) -> &PortStats {
        self.ports
            .get(port as usize)
            .unwrap_or_else(|| &self.ports[0])
    }

    /// Snapshot one port.
    pub fn snapshot(&self, port: u16) -> PortStatsSnapshot {
        self.port(port).snapshot()
    }

    /// Snapshot every port.
    pub fn snapshot_all(&self) -> Vec<PortStatsSnapshot> {
        self.ports.iter().map(|p| p.snapshot()).collect()
    }

    /// Log a one-line summary per active port.
    pub fn report(&self) {
        for (port, snap) in self.snapshot_all().iter().enumerate() {
            if *snap == PortStatsSnapshot::default() {
                continue;
            }
            tracing::info!(
                node = self.node_id,
                port,
                recv = snap.recv,
                sent = snap.sent,
                sw_drop = snap.sw_drop,
                rx_drop = snap.rx_drop,
                tx_drop = snap.tx_drop,
                invalid = snap.invalid,
                "port counters"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = NodeStats::new(0, 2);
        stats.port(0).recv.fetch_add(10, Ordering::Relaxed);
        stats.port(1).sw_drop.fetch_add(3, Ordering::Relaxed);
        assert_eq!(stats.snapshot(0).recv, 10);
        assert_eq!(stats.snapshot(1).sw_drop, 3);
        assert_eq!(stats.snapshot(1).recv, 0);
    }

    #[test]
    fn test_out_of_range_port_folds_to_zero() {
        let stats = NodeStats::new(0, 1);
        stats.port(7).invalid.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.snapshot(0).invalid, 1);
    }
}
