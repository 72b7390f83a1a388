//! Structural elements: graph entry/exit, discard, identity.

use crate::element::{ConfigContext, Disposition, Element};
use pktgraph_core::{AnnoSlot, Error, Packet, Result};

/// Graph root fed by the SW-RX stage for one input port.
pub struct FromDevice {
    port: u16,
}

impl FromDevice {
    /// New element; the port comes from `configure`.
    pub fn new() -> Self {
        Self { port: 0 }
    }

    /// Ingress port this root accepts.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for FromDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for FromDevice {
    fn class_name(&self) -> &'static str {
        "FromDevice"
    }

    fn port_counts(&self) -> (usize, usize) {
        (1, 1)
    }

    fn configure(&mut self, ctx: &ConfigContext, args: &[String]) -> Result<()> {
        let port: u16 = args
            .first()
            .ok_or_else(|| Error::Config("FromDevice needs a port".into()))?
            .parse()
            .map_err(|_| Error::Config("FromDevice: invalid port".into()))?;
        if (port as usize) >= ctx.num_ports {
            return Err(Error::Config(format!(
                "FromDevice({}) but only {} ports exist",
                port, ctx.num_ports
            )));
        }
        self.port = port;
        Ok(())
    }

    fn process(&mut self, _input_port: usize, pkt: &mut Packet) -> Disposition {
        pkt.anno.set(AnnoSlot::IfaceIn, self.port as u64);
        Disposition::Pass(0)
    }

    fn rx_port(&self) -> Option<u16> {
        Some(self.port)
    }
}

/// TX sink for one output port; the graph wires its output to the port's
/// TX ring at build time.
pub struct ToDevice {
    port: u16,
}

impl ToDevice {
    /// New element; the port comes from `configure`.
    pub fn new() -> Self {
        Self { port: 0 }
    }

    /// Egress port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for ToDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for ToDevice {
    fn class_name(&self) -> &'static str {
        "ToDevice"
    }

    fn port_counts(&self) -> (usize, usize) {
        (1, 1)
    }

    fn configure(&mut self, ctx: &ConfigContext, args: &[String]) -> Result<()> {
        let port: u16 = args
            .first()
            .ok_or_else(|| Error::Config("ToDevice needs a port".into()))?
            .parse()
            .map_err(|_| Error::Config("ToDevice: invalid port".into()))?;
        if (port as usize) >= ctx.num_ports {
            return Err(Error::Config(format!(
                "ToDevice({}) but only {} ports exist",
                port, ctx.num_ports
            )));
        }
        self.port = port;
        Ok(())
    }

    fn process(&mut self, _input_port: usize, pkt: &mut Packet) -> Disposition {
        pkt.anno.set(AnnoSlot::IfaceOut, self.port as u64);
        Disposition::Pass(0)
    }

    fn tx_port(&self) -> Option<u16> {
        Some(self.port)
    }
}

/// Drops everything.
pub struct Discard;

impl Discard {
    /// New element.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Discard {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for Discard {
    fn class_name(&self) -> &'static str {
        "Discard"
    }

    fn port_counts(&self) -> (usize, usize) {
        (1, 0)
    }

    fn process(&mut self, _input_port: usize, _pkt: &mut Packet) -> Disposition {
        Disposition::Drop
    }
}

/// Passes packets through untouched.
pub struct Identity;

impl Identity {
    /// New element.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for Identity {
    fn class_name(&self) -> &'static str {
        "Identity"
    }

    fn port_counts(&self) -> (usize, usize) {
        (1, 1)
    }

    fn process(&mut self, _input_port: usize, _pkt: &mut Packet) -> Disposition {
        Disposition::Pass(0)
    }
}
