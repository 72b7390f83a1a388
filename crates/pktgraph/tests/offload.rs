//! The offload path, driven step by step: prepare/park on the computation
//! side, launch on the device side, copy-back and resume.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha1::Sha1;

use pktgraph::element::ConfigContext;
use pktgraph::graph::{ElementGraph, GraphEnv, OffloadEnv, RunOutcome};
use pktgraph::stats::NodeStats;
use pktgraph_core::{
    AnnoSlot, CompletionStatus, ComputeDevice, DatablockRegistry, DeviceKind, NodeLocalStorage,
    Packet, PacketBatch, PacketPool, PipelineConfig, ProducerMode, Ring, Watcher,
};
use pktgraph_cpu::EmulatedDevice;

const ETHER_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const AUTH_OFFSET: usize = ETHER_HDR_LEN + IPV4_HDR_LEN;
const DIGEST_LEN: usize = 20;

fn esp_frame(payload_len: usize) -> Vec<u8> {
    let tot_len = IPV4_HDR_LEN + payload_len + DIGEST_LEN;
    let mut f = vec![0u8; ETHER_HDR_LEN + tot_len];
    f[12] = 0x08;
    f[ETHER_HDR_LEN] = 0x45;
    f[ETHER_HDR_LEN + 2..ETHER_HDR_LEN + 4].copy_from_slice(&(tot_len as u16).to_be_bytes());
    f[ETHER_HDR_LEN + 9] = 50;
    for (i, b) in f[AUTH_OFFSET..AUTH_OFFSET + payload_len].iter_mut().enumerate() {
        *b = i as u8;
    }
    f
}

fn expected_digest(frame: &[u8]) -> Vec<u8> {
    let key: Vec<u8> = b"abcdabcd".iter().copied().cycle().take(64).collect();
    let mut mac = Hmac::<Sha1>::new_from_slice(&key).unwrap();
    mac.update(&frame[AUTH_OFFSET..frame.len() - DIGEST_LEN]);
    mac.finalize().into_bytes().to_vec()
}

struct OffloadBed {
    graph: ElementGraph,
    env: GraphEnv,
    pool: PacketPool,
}

fn build_bed() -> OffloadBed {
    let pipeline =
        PipelineConfig::parse("FromDevice(0) -> IPsecAuthHMACSHA1(8) -> ToDevice(1)").unwrap();
    let ctx = ConfigContext {
        num_ports: 2,
        node_id: 0,
    };
    let mut graph = ElementGraph::build(&pipeline, &ctx).unwrap();

    let nls = Arc::new(NodeLocalStorage::new(0));
    let mut registry = DatablockRegistry::new();
    graph.register_datablocks(&mut registry).unwrap();
    graph.initialize_global().unwrap();
    graph.initialize_per_node(&nls).unwrap();

    let mut device = EmulatedDevice::new(0, 4);
    graph.initialize_offloadables(&mut device, &nls).unwrap();
    graph.initialize(&nls).unwrap();

    let cctx_pool = vec![
        device.get_available_context().unwrap(),
        device.get_available_context().unwrap(),
    ];

    let tx_rings = vec![
        Arc::new(Ring::new(256, ProducerMode::Single)),
        Arc::new(Ring::new(256, ProducerMode::Single)),
    ];
    let drop_ring = Arc::new(Ring::new(256, ProducerMode::Multi));
    let completion_ring = Arc::new(Ring::new(64, ProducerMode::Single));
    completion_ring.attach_watcher(Watcher::new());
    let task_ring = Arc::new(Ring::new(64, ProducerMode::Multi));
    task_ring.attach_watcher(Watcher::new());

    let env = GraphEnv {
        tx_rings,
        drop_ring,
        stats: Arc::new(NodeStats::new(0, 2)),
        preserve_latency: false,
        offload: Some(OffloadEnv {
            device_kind: DeviceKind::Emulated,
            task_ring,
            completion_ring,
            cctx_pool,
            registry: Arc::new(registry),
            nls,
            next_task_id: 1,
        }),
    };
    let pool = PacketPool::new("test", 0, 2048, 128).unwrap();
    OffloadBed { graph, env, pool }
}

fn esp_batch(bed: &OffloadBed, frames: &[Vec<u8>], flow: Option<u64>) -> PacketBatch {
    let mut batch = PacketBatch::new(32, 0, 1);
    for f in frames {
        let mut pkt = Packet::synthesize(&bed.pool, f, 0).unwrap();
        if let Some(flow) = flow {
            pkt.anno.set(AnnoSlot::IpsecFlowId, flow);
        }
        batch.push(pkt).unwrap();
    }
    batch
}

/// Run the coprocessor side of one staged task.
fn run_device_side(bed: &mut OffloadBed) -> CompletionStatus {
    let oenv = bed.env.offload.as_mut().unwrap();
    let task = oenv.task_ring.try_dequeue().expect("task staged");
    let mut guard = task.cctx.lock();
    for arg in &task.args {
        guard.push_kernel_arg(*arg);
    }
    guard
        .enqueue_kernel_launch(&task.kernel, task.res, &task.datablocks)
        .unwrap();
    guard.sync()
}

#[test]
fn offloaded_batch_authenticates_and_resumes() {
    let mut bed = build_bed();
    let frames: Vec<Vec<u8>> = (0..4).map(|_| esp_frame(128)).collect();
    let batch = esp_batch(&bed, &frames, Some(0));

    let outcome = bed.graph.run_batch(batch, &mut bed.env).unwrap();
    let RunOutcome::Parked { task_id, parked } = outcome else {
        panic!("expected the batch to park behind the offload");
    };
    assert_eq!(parked.items.len(), 4);
    assert_eq!(parked.batch.pending_offloads, 4);

    let status = run_device_side(&mut bed);
    assert_eq!(status, CompletionStatus::Success);
    assert!(task_id > 0);

    let outcome = bed.graph.resume(parked, status, &mut bed.env).unwrap();
    assert!(matches!(outcome, RunOutcome::Done));

    // All four packets exit on port 1 with the correct signature.
    let want = expected_digest(&frames[0]);
    let mut seen = 0;
    while let Ok(pkt) = bed.env.tx_rings[1].try_dequeue() {
        seen += 1;
        let got = &pkt.data()[pkt.len() - DIGEST_LEN..];
        assert_eq!(got, want.as_slice());
    }
    assert_eq!(seen, 4);
    // The context returned to the pool.
    assert_eq!(bed.env.offload.as_ref().unwrap().cctx_pool.len(), 2);
}

#[test]
fn offload_and_cpu_paths_agree() {
    let mut bed = build_bed();
    let frame = esp_frame(200);

    // Offload path.
    let batch = esp_batch(&bed, &[frame.clone()], Some(3));
    let RunOutcome::Parked { parked, .. } = bed.graph.run_batch(batch, &mut bed.env).unwrap()
    else {
        panic!("expected park");
    };
    let status = run_device_side(&mut bed);
    bed.graph.resume(parked, status, &mut bed.env).unwrap();
    let offloaded = bed.env.tx_rings[1].try_dequeue().unwrap();

    // CPU path: same graph, offload plumbing removed.
    bed.env.offload = None;
    let batch = esp_batch(&bed, &[frame], Some(3));
    match bed.graph.run_batch(batch, &mut bed.env).unwrap() {
        RunOutcome::Done => {}
        RunOutcome::Parked { .. } => panic!("cpu path must not park"),
    }
    let cpu = bed.env.tx_rings[1].try_dequeue().unwrap();

    assert_eq!(offloaded.data(), cpu.data());
}

#[test]
fn failed_offload_abandons_batch() {
    let mut bed = build_bed();
    let frames: Vec<Vec<u8>> = (0..3).map(|_| esp_frame(64)).collect();
    let batch = esp_batch(&bed, &frames, Some(0));

    let RunOutcome::Parked { parked, .. } = bed.graph.run_batch(batch, &mut bed.env).unwrap()
    else {
        panic!("expected park");
    };
    // Discard the device side entirely and fail the completion.
    let _ = bed.env.offload.as_mut().unwrap().task_ring.try_dequeue();
    let outcome = bed
        .graph
        .resume(parked, CompletionStatus::Failed, &mut bed.env)
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Done));
    assert_eq!(bed.env.tx_rings[1].len(), 0);
    assert_eq!(bed.env.stats.snapshot(0).sw_drop, 3);
    // Context reclaimed even on failure.
    assert_eq!(bed.env.offload.as_ref().unwrap().cctx_pool.len(), 2);
}

#[test]
fn missing_flow_ids_fall_out_before_staging() {
    let mut bed = build_bed();
    // Two good packets, one without a flow id.
    let mut batch = PacketBatch::new(32, 0, 1);
    for flow in [Some(0u64), None, Some(1)] {
        let mut pkt = Packet::synthesize(&bed.pool, &esp_frame(96), 0).unwrap();
        if let Some(flow) = flow {
            pkt.anno.set(AnnoSlot::IpsecFlowId, flow);
        }
        batch.push(pkt).unwrap();
    }

    let RunOutcome::Parked { parked, .. } = bed.graph.run_batch(batch, &mut bed.env).unwrap()
    else {
        panic!("expected park");
    };
    // Only the two annotated packets were staged; the third was killed.
    assert_eq!(parked.items.len(), 2);
    assert_eq!(bed.env.stats.snapshot(0).invalid, 1);

    let status = run_device_side(&mut bed);
    assert_eq!(status, CompletionStatus::Success);
    let outcome = bed.graph.resume(parked, status, &mut bed.env).unwrap();
    assert!(matches!(outcome, RunOutcome::Done));
    assert_eq!(bed.env.tx_rings[1].len(), 2);
}

#[test]
fn exhausted_context_pool_falls_back_to_cpu() {
    let mut bed = build_bed();
    bed.env.offload.as_mut().unwrap().cctx_pool.clear();
    let frame = esp_frame(80);
    let batch = esp_batch(&bed, &[frame.clone()], Some(0));
    match bed.graph.run_batch(batch, &mut bed.env).unwrap() {
        RunOutcome::Done => {}
        RunOutcome::Parked { .. } => panic!("no contexts, must run on cpu"),
    }
    let pkt = bed.env.tx_rings[1].try_dequeue().unwrap();
    assert_eq!(
        &pkt.data()[pkt.len() - DIGEST_LEN..],
        expected_digest(&frame).as_slice()
    );
}

#[test]
fn fully_tombstoned_batch_skips_elements() {
    let mut bed = build_bed();
    let mut batch = esp_batch(&bed, &[esp_frame(64), esp_frame(64)], Some(0));
    batch.take(0);
    batch.take(1);
    assert!(batch.fully_tombstoned());
    match bed.graph.run_batch(batch, &mut bed.env).unwrap() {
        RunOutcome::Done => {}
        RunOutcome::Parked { .. } => panic!("nothing to offload"),
    }
    assert_eq!(bed.env.tx_rings[1].len(), 0);
    let oenv = bed.env.offload.as_ref().unwrap();
    assert!(oenv.task_ring.is_empty());
}
