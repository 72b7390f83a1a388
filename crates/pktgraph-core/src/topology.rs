//! NUMA topology detection and thread placement.
//!
//! Every worker thread is bound to exactly one core on one node before it
//! touches any node-local state; all memory a thread reads in the steady
//! state lives on that node.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Placement of one worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// NUMA node the thread (and its memory) belongs to.
    pub node_id: usize,
    /// CPU core the thread is pinned to.
    pub core_id: usize,
    /// Index among same-role threads on this node.
    pub local_thread_idx: usize,
    /// Index among same-role threads in the whole process.
    pub global_thread_idx: usize,
}

/// Host CPU/NUMA topology snapshot taken at startup.
#[derive(Debug, Clone)]
pub struct Topology {
    num_nodes: usize,
    node_of_core: Vec<usize>,
}

impl Topology {
    /// Detect the topology from sysfs, falling back to a single node
    /// covering every online core.
    pub fn detect() -> Self {
        let num_cores = available_cores();
        if let Some(map) = Self::probe_sysfs(num_cores) {
            let num_nodes = map.iter().copied().max().map(|m| m + 1).unwrap_or(1);
            return Self {
                num_nodes,
                node_of_core: map,
            };
        }
        Self {
            num_nodes: 1,
            node_of_core: vec![0; num_cores],
        }
    }

    /// Build a synthetic topology (tests and single-node fallback).
    pub fn flat(num_nodes: usize, cores_per_node: usize) -> Self {
        let mut node_of_core = Vec::with_capacity(num_nodes * cores_per_node);
        for node in 0..num_nodes {
            for _ in 0..cores_per_node {
                node_of_core.push(node);
            }
        }
        Self {
            num_nodes,
            node_of_core,
        }
    }

    fn probe_sysfs(num_cores: usize) -> Option<Vec<usize>> {
        let base = Path::new("/sys/devices/system/node");
        if !base.is_dir() {
            return None;
        }
        let mut map = vec![0usize; num_cores];
        let mut found = false;
        for entry in fs::read_dir(base).ok()? {
            let entry = entry.ok()?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(id_str) = name.strip_prefix("node") else {
                continue;
            };
            let Ok(node_id) = id_str.parse::<usize>() else {
                continue;
            };
            let cpulist = fs::read_to_string(entry.path().join("cpulist")).ok()?;
            for core in parse_cpulist(cpulist.trim()) {
                if core < num_cores {
                    map[core] = node_id;
                    found = true;
                }
            }
        }
        found.then_some(map)
    }

    /// Number of NUMA nodes.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Number of cores known to the topology.
    pub fn num_cores(&self) -> usize {
        self.node_of_core.len()
    }

    /// Node a core belongs to. Unknown cores map to node 0.
    pub fn node_of_core(&self, core_id: usize) -> usize {
        self.node_of_core.get(core_id).copied().unwrap_or(0)
    }
}

/// Parse a sysfs cpulist such as `0-3,8,10-11`.
fn parse_cpulist(list: &str) -> Vec<usize> {
    let mut cores = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                cores.extend(lo..=hi);
            }
        } else if let Ok(core) = part.parse::<usize>() {
            cores.push(core);
        }
    }
    cores
}

/// Number of online cores.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pin the calling thread to a single core.
#[cfg(target_os = "linux")]
pub fn bind_current_thread(core_id: usize) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(Error::Thread(format!(
                "sched_setaffinity(core {}) failed: {}",
                core_id,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Pinning is a no-op on non-Linux hosts.
#[cfg(not(target_os = "linux"))]
pub fn bind_current_thread(_core_id: usize) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpulist() {
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpulist("0-1,8,10-11"), vec![0, 1, 8, 10, 11]);
        assert!(parse_cpulist("").is_empty());
    }

    #[test]
    fn test_flat_topology() {
        let topo = Topology::flat(2, 4);
        assert_eq!(topo.num_nodes(), 2);
        assert_eq!(topo.num_cores(), 8);
        assert_eq!(topo.node_of_core(0), 0);
        assert_eq!(topo.node_of_core(5), 1);
        // Out-of-range cores fall back to node 0.
        assert_eq!(topo.node_of_core(64), 0);
    }

    #[test]
    fn test_detect_does_not_panic() {
        let topo = Topology::detect();
        assert!(topo.num_nodes() >= 1);
        assert!(topo.num_cores() >= 1);
    }

    #[test]
    fn test_bind_current_thread() {
        // Core 0 always exists.
        bind_current_thread(0).unwrap();
    }
}
