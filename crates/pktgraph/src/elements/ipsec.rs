//! IPsec ESP authentication with HMAC-SHA1.
//!
//! Input packets are assumed ESP-encapsulated:
//!
//! ```text
//! +----------+---------------+-----+----------+---------+-------+---------------------+
//! | Ethernet | IP(proto=ESP) | ESP | inner IP | payload | extra | HMAC-SHA1 signature |
//! +----------+---------------+-----+----------+---------+-------+---------------------+
//!            ^iph            ^auth span start
//!                            <==== authenticated part ====>
//! ```
//!
//! The per-tunnel key table is built once in `initialize_global`, copied
//! into node-local storage in `initialize_per_node`, and the build-time
//! copy is freed in `initialize`. The device arm keeps the same table
//! resident on the device and authenticates a whole batch per launch.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::element::{ConfigContext, Disposition, Element, OffloadableElement};
use pktgraph_core::datablock::DatablockDesc;
use pktgraph_core::{
    AnnoSlot, ComputeDevice, DeviceBufferId, DeviceKind, Error, KernelArg, KernelLaunch,
    KernelRef, NodeLocalStorage, OffloadArm, Packet, Result, Roi,
};

type HmacSha1 = Hmac<Sha1>;

/// HMAC key bytes per tunnel.
pub const HMAC_KEY_SIZE: usize = 64;
/// SHA-1 digest length.
pub const SHA1_DIGEST_LEN: usize = 20;

const ETHER_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
/// Offset of the authenticated span (ESP header) within the frame.
const AUTH_SPAN_OFFSET: usize = ETHER_HDR_LEN + IPV4_HDR_LEN;

const NLS_SA_TABLE: &str = "ipsec.hmac.sa_table";
const NLS_FLOWS: &str = "ipsec.hmac.flows";
const NLS_FLOWS_DEV: &str = "ipsec.hmac.flows_dev";

const DB_PAYLOAD: &str = "ipsec.auth.payload";
const DB_FLOW_ID: &str = "ipsec.auth.flow_id";

/// One security-association entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct HmacSaEntry {
    /// Tunnel index.
    pub entry_idx: u32,
    /// HMAC key.
    pub hmac_key: [u8; HMAC_KEY_SIZE],
}

const SA_ENTRY_SIZE: usize = std::mem::size_of::<HmacSaEntry>();

/// ESP HMAC-SHA1 authentication element.
pub struct IPsecAuthHMACSHA1 {
    num_tunnels: usize,
    build_table: Option<HashMap<(u32, u32), u32>>,
    build_flows: Option<Vec<HmacSaEntry>>,
    flows: Option<Arc<Vec<HmacSaEntry>>>,
}

impl IPsecAuthHMACSHA1 {
    /// New element; tunnel count comes from `configure`.
    pub fn new() -> Self {
        Self {
            num_tunnels: 0,
            build_table: None,
            build_flows: None,
            flows: None,
        }
    }

    fn authenticate(&self, pkt: &mut Packet) -> Disposition {
        let Some(flow_id) = pkt.anno.get(AnnoSlot::IpsecFlowId) else {
            return Disposition::Drop;
        };
        let Some(flows) = self.flows.as_ref() else {
            return Disposition::Drop;
        };
        let Some(entry) = flows.get(flow_id as usize) else {
            return Disposition::Drop;
        };

        let data = pkt.data();
        if data.len() < AUTH_SPAN_OFFSET + SHA1_DIGEST_LEN {
            return Disposition::Drop;
        }
        let ihl = ((data[ETHER_HDR_LEN] & 0x0f) as usize) * 4;
        let tot_len = u16::from_be_bytes([data[ETHER_HDR_LEN + 2], data[ETHER_HDR_LEN + 3]]) as usize;
        let Some(payload_len) = tot_len.checked_sub(ihl + SHA1_DIGEST_LEN) else {
            return Disposition::Drop;
        };
        let digest_at = AUTH_SPAN_OFFSET + payload_len;
        if digest_at + SHA1_DIGEST_LEN > data.len() {
            return Disposition::Drop;
        }

        let Ok(mut mac) = HmacSha1::new_from_slice(&entry.hmac_key) else {
            return Disposition::Drop;
        };
        mac.update(&pkt.data()[AUTH_SPAN_OFFSET..digest_at]);
        let digest = mac.finalize().into_bytes();
        pkt.data_mut()[digest_at..digest_at + SHA1_DIGEST_LEN]
            .copy_from_slice(&digest[..SHA1_DIGEST_LEN]);
        Disposition::Pass(0)
    }
}

impl Default for IPsecAuthHMACSHA1 {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for IPsecAuthHMACSHA1 {
    fn class_name(&self) -> &'static str {
        "IPsecAuthHMACSHA1"
    }

    fn port_counts(&self) -> (usize, usize) {
        (1, 1)
    }

    fn configure(&mut self, _ctx: &ConfigContext, args: &[String]) -> Result<()> {
        self.num_tunnels = match args.first() {
            Some(arg) => arg
                .parse()
                .map_err(|_| Error::Config(format!("IPsecAuthHMACSHA1: bad tunnel count '{}'", arg)))?,
            None => 1024,
        };
        if self.num_tunnels == 0 {
            return Err(Error::Config("IPsecAuthHMACSHA1: zero tunnels".into()));
        }
        Ok(())
    }

    fn initialize_global(&mut self) -> Result<()> {
        let mut table = HashMap::with_capacity(self.num_tunnels);
        let mut flows = Vec::with_capacity(self.num_tunnels);
        for i in 0..self.num_tunnels {
            let pair = (0x0a00_0001u32, 0x0a00_0000u32 | (i as u32 + 1));
            table.insert(pair, i as u32);
            let mut entry = HmacSaEntry {
                entry_idx: i as u32,
                hmac_key: [0u8; HMAC_KEY_SIZE],
            };
            for (chunk, src) in entry.hmac_key.chunks_mut(8).zip(std::iter::repeat(b"abcdabcd")) {
                chunk.copy_from_slice(src);
            }
            flows.push(entry);
        }
        self.build_table = Some(table);
        self.build_flows = Some(flows);
        Ok(())
    }

    fn initialize_per_node(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        let table = self.build_table.as_ref().ok_or_else(|| {
            Error::Element {
                name: "IPsecAuthHMACSHA1".into(),
                reason: "per-node init before global init".into(),
            }
        })?;
        let flows = self.build_flows.as_ref().ok_or_else(|| Error::Element {
            name: "IPsecAuthHMACSHA1".into(),
            reason: "per-node init before global init".into(),
        })?;
        nls.put_slot(NLS_SA_TABLE, table.clone())?;
        nls.put_slot(NLS_FLOWS, flows.clone())?;
        nls.alloc_slot::<DeviceBufferId>(NLS_FLOWS_DEV)?;
        Ok(())
    }

    fn initialize(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        self.flows = Some(nls.get_slot::<Vec<HmacSaEntry>>(NLS_FLOWS)?);
        // Build-time state is dead once every node has its copy.
        self.build_table = None;
        self.build_flows = None;
        Ok(())
    }

    fn process(&mut self, _input_port: usize, pkt: &mut Packet) -> Disposition {
        self.authenticate(pkt)
    }
}

impl OffloadableElement for IPsecAuthHMACSHA1 {
    fn datablocks(&self) -> Vec<DatablockDesc> {
        vec![
            DatablockDesc {
                name: DB_PAYLOAD,
                read_roi: Roi::Tail {
                    offset: AUTH_SPAN_OFFSET,
                },
                write_roi: Roi::Tail {
                    offset: AUTH_SPAN_OFFSET,
                },
            },
            DatablockDesc {
                name: DB_FLOW_ID,
                read_roi: Roi::AnnoValue {
                    slot: AnnoSlot::IpsecFlowId,
                },
                write_roi: Roi::None,
            },
        ]
    }

    fn offload_arms(&self) -> Vec<OffloadArm> {
        vec![OffloadArm {
            kind: DeviceKind::Emulated,
            kernel: KernelRef::Host(ipsec_hmac_sha1_kernel),
            workgroup_size: self.desired_workgroup_size(DeviceKind::Emulated),
        }]
    }

    fn desired_workgroup_size(&self, kind: DeviceKind) -> usize {
        match kind {
            DeviceKind::Cuda => 64,
            DeviceKind::Emulated => 32,
        }
    }

    fn accel_init(
        &mut self,
        device: &mut dyn ComputeDevice,
        nls: &NodeLocalStorage,
    ) -> Result<()> {
        let flows = nls.get_slot::<Vec<HmacSaEntry>>(NLS_FLOWS)?;
        let buf = device.alloc_device_buffer(flows.len() * SA_ENTRY_SIZE)?;
        device.write_device_buffer(buf, 0, bytemuck::cast_slice(flows.as_slice()))?;
        nls.init_slot(NLS_FLOWS_DEV, buf)?;
        Ok(())
    }

    fn stage_args(&self, nls: &NodeLocalStorage, args: &mut Vec<KernelArg>) -> Result<()> {
        let buf = nls.get_slot::<DeviceBufferId>(NLS_FLOWS_DEV)?;
        args.push(KernelArg::Buffer(*buf));
        Ok(())
    }

    fn postproc(&mut self, _input_port: usize, _pkt: &mut Packet) -> Disposition {
        Disposition::Pass(0)
    }
}

/// Batched HMAC-SHA1 kernel. Item 0 of each launch argument pair is the
/// authenticated span, item 1 the tunnel index; the signature lands in the
/// last 20 bytes of the output span.
pub fn ipsec_hmac_sha1_kernel(launch: &mut KernelLaunch<'_>) -> Result<()> {
    let Some(KernelArg::Buffer(flows_buf)) = launch.args.first().copied() else {
        return Err(Error::Device(
            "ipsec kernel expects the flow table as its first argument".into(),
        ));
    };
    let flows = launch
        .buffers
        .read_arc(flows_buf)
        .ok_or_else(|| Error::Device("ipsec kernel: flow table buffer missing".into()))?;

    for i in 0..launch.item_count(0) {
        let (in_off, in_len) = launch.item_in_span(0, i);
        let (out_off, out_len) = launch.item_out_span(0, i);
        let (fid_off, fid_len) = launch.item_in_span(1, i);
        if in_len < SHA1_DIGEST_LEN || out_len != in_len || fid_len != 8 {
            return Err(Error::Device(format!(
                "ipsec kernel: malformed item {} ({}B in, {}B out, {}B flow id)",
                i, in_len, out_len, fid_len
            )));
        }

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&launch.input[fid_off..fid_off + 8]);
        let flow = u64::from_le_bytes(raw) as usize;
        let key_off = flow * SA_ENTRY_SIZE + 4;
        if key_off + HMAC_KEY_SIZE > flows.len() {
            return Err(Error::Device(format!(
                "ipsec kernel: flow {} outside the table",
                flow
            )));
        }

        launch.output[out_off..out_off + in_len]
            .copy_from_slice(&launch.input[in_off..in_off + in_len]);

        let mut mac = HmacSha1::new_from_slice(&flows[key_off..key_off + HMAC_KEY_SIZE])
            .map_err(|_| Error::Device("ipsec kernel: bad key length".into()))?;
        mac.update(&launch.input[in_off..in_off + in_len - SHA1_DIGEST_LEN]);
        let digest = mac.finalize().into_bytes();
        launch.output[out_off + in_len - SHA1_DIGEST_LEN..out_off + in_len]
            .copy_from_slice(&digest[..SHA1_DIGEST_LEN]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pktgraph_core::PacketPool;

    /// Build an ESP-encapsulated frame: ether + IPv4(ihl=5) + payload with
    /// trailing digest space; total IP length covers everything after L2.
    fn esp_frame(payload_len: usize) -> Vec<u8> {
        let tot_len = IPV4_HDR_LEN + payload_len + SHA1_DIGEST_LEN;
        let mut frame = vec![0u8; ETHER_HDR_LEN + tot_len];
        frame[12] = 0x08; // IPv4 ethertype
        frame[ETHER_HDR_LEN] = 0x45;
        frame[ETHER_HDR_LEN + 2..ETHER_HDR_LEN + 4]
            .copy_from_slice(&(tot_len as u16).to_be_bytes());
        frame[ETHER_HDR_LEN + 9] = 50; // ESP
        for (i, b) in frame[AUTH_SPAN_OFFSET..AUTH_SPAN_OFFSET + payload_len]
            .iter_mut()
            .enumerate()
        {
            *b = i as u8;
        }
        frame
    }

    fn ready_element(tunnels: usize) -> (IPsecAuthHMACSHA1, NodeLocalStorage) {
        let nls = NodeLocalStorage::new(0);
        let mut e = IPsecAuthHMACSHA1::new();
        let ctx = ConfigContext {
            num_ports: 1,
            node_id: 0,
        };
        e.configure(&ctx, &[tunnels.to_string()]).unwrap();
        e.initialize_global().unwrap();
        e.initialize_per_node(&nls).unwrap();
        e.initialize(&nls).unwrap();
        (e, nls)
    }

    fn expected_digest(frame: &[u8]) -> Vec<u8> {
        let key: Vec<u8> = b"abcdabcd".iter().copied().cycle().take(64).collect();
        let mut mac = HmacSha1::new_from_slice(&key).unwrap();
        mac.update(&frame[AUTH_SPAN_OFFSET..frame.len() - SHA1_DIGEST_LEN]);
        mac.finalize().into_bytes().to_vec()
    }

    #[test]
    fn test_cpu_path_digest() {
        let (mut e, _nls) = ready_element(8);
        let frame = esp_frame(128);
        let want = expected_digest(&frame);

        let pool = PacketPool::new("t", 0, 2048, 4).unwrap();
        let mut pkt = Packet::synthesize(&pool, &frame, 0).unwrap();
        pkt.anno.set(AnnoSlot::IpsecFlowId, 0);
        assert_eq!(e.process(0, &mut pkt), Disposition::Pass(0));
        let got = &pkt.data()[pkt.len() - SHA1_DIGEST_LEN..];
        assert_eq!(got, want.as_slice());
    }

    #[test]
    fn test_missing_flow_id_drops() {
        let (mut e, _nls) = ready_element(8);
        let pool = PacketPool::new("t", 0, 2048, 4).unwrap();
        let mut pkt = Packet::synthesize(&pool, &esp_frame(64), 0).unwrap();
        assert_eq!(e.process(0, &mut pkt), Disposition::Drop);
    }

    #[test]
    fn test_out_of_range_flow_drops() {
        let (mut e, _nls) = ready_element(2);
        let pool = PacketPool::new("t", 0, 2048, 4).unwrap();
        let mut pkt = Packet::synthesize(&pool, &esp_frame(64), 0).unwrap();
        pkt.anno.set(AnnoSlot::IpsecFlowId, 99);
        assert_eq!(e.process(0, &mut pkt), Disposition::Drop);
    }

    #[test]
    fn test_runt_packet_drops() {
        let (mut e, _nls) = ready_element(2);
        let pool = PacketPool::new("t", 0, 2048, 4).unwrap();
        let mut pkt = Packet::synthesize(&pool, &[0u8; 20], 0).unwrap();
        pkt.anno.set(AnnoSlot::IpsecFlowId, 0);
        assert_eq!(e.process(0, &mut pkt), Disposition::Drop);
    }

    #[test]
    fn test_build_state_freed_after_init() {
        let (e, _nls) = ready_element(4);
        assert!(e.build_table.is_none());
        assert!(e.build_flows.is_none());
        assert!(e.flows.is_some());
    }

    #[test]
    fn test_sa_table_contents() {
        let (_e, nls) = ready_element(4);
        let table = nls
            .get_slot::<HashMap<(u32, u32), u32>>(NLS_SA_TABLE)
            .unwrap();
        assert_eq!(table.get(&(0x0a000001, 0x0a000003)), Some(&2));
        let flows = nls.get_slot::<Vec<HmacSaEntry>>(NLS_FLOWS).unwrap();
        assert_eq!(flows.len(), 4);
        assert_eq!(&flows[0].hmac_key[..8], b"abcdabcd");
    }
}
