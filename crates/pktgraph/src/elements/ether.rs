//! Ethernet-layer elements.

use crate::element::{ConfigContext, Disposition, Element};
use pktgraph_core::{AnnoSlot, Error, Packet, Result};

/// Minimum sane L2 frame for forwarding decisions.
const ETHER_HDR_LEN: usize = 14;

/// Static L2 forwarder: stamps every packet with a configured next port.
///
/// Accepts either a bare port (`L2ForwardCreate(1)`) or keyed tokens
/// (`L2ForwardCreate(next_port=1 mode=forward)`).
pub struct L2ForwardCreate {
    mode: ForwardMode,
    next_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardMode {
    /// Send to the configured next port.
    Forward,
    /// Send back out the ingress port with src/dst MAC swapped.
    Echoback,
}

impl L2ForwardCreate {
    /// New element; the target comes from `configure`.
    pub fn new() -> Self {
        Self {
            mode: ForwardMode::Forward,
            next_port: 0,
        }
    }
}

impl Default for L2ForwardCreate {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for L2ForwardCreate {
    fn class_name(&self) -> &'static str {
        "L2ForwardCreate"
    }

    fn port_counts(&self) -> (usize, usize) {
        (1, 1)
    }

    fn configure(&mut self, ctx: &ConfigContext, args: &[String]) -> Result<()> {
        for arg in args {
            if let Some((key, value)) = arg.split_once('=') {
                match key {
                    "next_port" => {
                        self.next_port = value.parse().map_err(|_| {
                            Error::Config(format!("L2ForwardCreate: bad next_port '{}'", value))
                        })?;
                    }
                    "mode" => {
                        self.mode = match value {
                            "forward" => ForwardMode::Forward,
                            "echoback" => ForwardMode::Echoback,
                            other => {
                                return Err(Error::Config(format!(
                                    "L2ForwardCreate: unknown mode '{}'",
                                    other
                                )))
                            }
                        };
                    }
                    other => {
                        return Err(Error::Config(format!(
                            "L2ForwardCreate: unknown option '{}'",
                            other
                        )))
                    }
                }
            } else {
                self.next_port = arg.parse().map_err(|_| {
                    Error::Config(format!("L2ForwardCreate: bad port '{}'", arg))
                })?;
            }
        }
        if self.mode == ForwardMode::Forward && (self.next_port as usize) >= ctx.num_ports {
            return Err(Error::Config(format!(
                "L2ForwardCreate: next_port {} but only {} ports exist",
                self.next_port, ctx.num_ports
            )));
        }
        Ok(())
    }

    fn process(&mut self, _input_port: usize, pkt: &mut Packet) -> Disposition {
        if pkt.len() < ETHER_HDR_LEN {
            return Disposition::Drop;
        }
        match self.mode {
            ForwardMode::Forward => {
                pkt.anno.set(AnnoSlot::IfaceOut, self.next_port as u64);
            }
            ForwardMode::Echoback => {
                let data = pkt.data_mut();
                for i in 0..6 {
                    data.swap(i, i + 6);
                }
                let out = pkt.port() as u64;
                pkt.anno.set(AnnoSlot::IfaceOut, out);
            }
        }
        Disposition::Pass(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pktgraph_core::PacketPool;

    fn ctx() -> ConfigContext {
        ConfigContext {
            num_ports: 2,
            node_id: 0,
        }
    }

    #[test]
    fn test_configure_forms() {
        let mut e = L2ForwardCreate::new();
        e.configure(&ctx(), &["1".to_string()]).unwrap();
        assert_eq!(e.next_port, 1);

        let mut e = L2ForwardCreate::new();
        e.configure(&ctx(), &["next_port=1".to_string()]).unwrap();
        assert_eq!(e.next_port, 1);

        let mut e = L2ForwardCreate::new();
        assert!(e.configure(&ctx(), &["next_port=9".to_string()]).is_err());
    }

    #[test]
    fn test_forward_sets_out_port() {
        let pool = PacketPool::new("t", 0, 256, 4).unwrap();
        let mut pkt = Packet::synthesize(&pool, &[0u8; 60], 0).unwrap();
        let mut e = L2ForwardCreate::new();
        e.configure(&ctx(), &["1".to_string()]).unwrap();
        assert_eq!(e.process(0, &mut pkt), Disposition::Pass(0));
        assert_eq!(pkt.anno.get(AnnoSlot::IfaceOut), Some(1));
    }

    #[test]
    fn test_echoback_swaps_macs() {
        let pool = PacketPool::new("t", 0, 256, 4).unwrap();
        let mut frame = [0u8; 60];
        frame[..6].copy_from_slice(&[1, 1, 1, 1, 1, 1]);
        frame[6..12].copy_from_slice(&[2, 2, 2, 2, 2, 2]);
        let mut pkt = Packet::synthesize(&pool, &frame, 0).unwrap();
        let mut e = L2ForwardCreate::new();
        e.configure(&ctx(), &["mode=echoback".to_string()]).unwrap();
        e.process(0, &mut pkt);
        assert_eq!(&pkt.data()[..6], &[2, 2, 2, 2, 2, 2]);
        assert_eq!(&pkt.data()[6..12], &[1, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_runt_frame_dropped() {
        let pool = PacketPool::new("t", 0, 256, 4).unwrap();
        let mut pkt = Packet::synthesize(&pool, &[0u8; 8], 0).unwrap();
        let mut e = L2ForwardCreate::new();
        e.configure(&ctx(), &["1".to_string()]).unwrap();
        assert_eq!(e.process(0, &mut pkt), Disposition::Drop);
    }
}
