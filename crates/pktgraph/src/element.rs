//! The element contract.
//!
//! An element is one stage of the pipeline. Plain elements see packets one
//! at a time and return a routing disposition; offloadable elements
//! additionally describe their device I/O through datablocks and carry one
//! offload arm per supported device kind. The graph dispatches on the
//! [`ElementSlot`] tag rather than a class hierarchy.

use pktgraph_core::datablock::DatablockDesc;
use pktgraph_core::{
    ComputeDevice, DeviceKind, KernelArg, NodeLocalStorage, OffloadArm, Packet, Result,
};

/// What an element decided about one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Emit on the given output port.
    Pass(usize),
    /// Kill the packet; the buffer returns through the drop ring.
    Drop,
    /// Reserved slow-path class; routed like a drop, counted separately.
    SlowPath,
    /// The packet is owned by an in-flight offload.
    Pending,
}

/// Context handed to `configure`.
#[derive(Debug, Clone, Copy)]
pub struct ConfigContext {
    /// Number of TX ports in the system.
    pub num_ports: usize,
    /// NUMA node of the owning computation thread.
    pub node_id: usize,
}

/// Contract implemented by every pipeline stage.
///
/// The three init phases run in orchestration order: `initialize_global`
/// once per process (on the first computation context), then
/// `initialize_per_node` once per populated node, then `initialize` on
/// every computation thread. `process` is never called before
/// `initialize` has returned.
pub trait Element: Send {
    /// Stable class name used by the pipeline configuration.
    fn class_name(&self) -> &'static str;

    /// (input arity, output arity).
    fn port_counts(&self) -> (usize, usize);

    /// Consume configuration tokens.
    fn configure(&mut self, ctx: &ConfigContext, args: &[String]) -> Result<()> {
        let _ = (ctx, args);
        Ok(())
    }

    /// Build process-wide state, once.
    fn initialize_global(&mut self) -> Result<()> {
        Ok(())
    }

    /// Publish per-node state into node-local storage, once per node.
    fn initialize_per_node(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        let _ = nls;
        Ok(())
    }

    /// Resolve per-thread handles; runs on every computation thread.
    fn initialize(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        let _ = nls;
        Ok(())
    }

    /// Handle one packet.
    fn process(&mut self, input_port: usize, pkt: &mut Packet) -> Disposition;

    /// Ingress port filter for graph roots (`FromDevice` overrides).
    fn rx_port(&self) -> Option<u16> {
        None
    }

    /// TX sink port (`ToDevice` overrides); the builder wires the
    /// element's output to that port's TX ring.
    fn tx_port(&self) -> Option<u16> {
        None
    }
}

/// Extra contract for elements that can run on a compute device.
pub trait OffloadableElement: Element {
    /// Datablocks this element gathers, in kernel-argument order.
    fn datablocks(&self) -> Vec<DatablockDesc>;

    /// One arm per supported device kind.
    fn offload_arms(&self) -> Vec<OffloadArm>;

    /// Workgroup size the element wants on a device.
    fn desired_workgroup_size(&self, kind: DeviceKind) -> usize;

    /// Allocate device-resident resources. Runs on the coprocessor thread
    /// that owns the device command stream.
    fn accel_init(
        &mut self,
        device: &mut dyn ComputeDevice,
        nls: &NodeLocalStorage,
    ) -> Result<()>;

    /// Contribute kernel arguments for one task (element table first).
    fn stage_args(&self, nls: &NodeLocalStorage, args: &mut Vec<KernelArg>) -> Result<()>;

    /// Route one packet after its offload completed.
    fn postproc(&mut self, input_port: usize, pkt: &mut Packet) -> Disposition;
}

/// Capability-tagged element instance.
pub enum ElementSlot {
    /// CPU-only element.
    Plain(Box<dyn Element>),
    /// Element with an offload path.
    Offloadable(Box<dyn OffloadableElement>),
}

impl ElementSlot {
    /// Class name of the wrapped element.
    pub fn class_name(&self) -> &'static str {
        match self {
            ElementSlot::Plain(e) => e.class_name(),
            ElementSlot::Offloadable(e) => e.class_name(),
        }
    }

    /// (input arity, output arity) of the wrapped element.
    pub fn port_counts(&self) -> (usize, usize) {
        match self {
            ElementSlot::Plain(e) => e.port_counts(),
            ElementSlot::Offloadable(e) => e.port_counts(),
        }
    }

    /// Forward `configure`.
    pub fn configure(&mut self, ctx: &ConfigContext, args: &[String]) -> Result<()> {
        match self {
            ElementSlot::Plain(e) => e.configure(ctx, args),
            ElementSlot::Offloadable(e) => e.configure(ctx, args),
        }
    }

    /// Forward `initialize_global`.
    pub fn initialize_global(&mut self) -> Result<()> {
        match self {
            ElementSlot::Plain(e) => e.initialize_global(),
            ElementSlot::Offloadable(e) => e.initialize_global(),
        }
    }

    /// Forward `initialize_per_node`.
    pub fn initialize_per_node(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        match self {
            ElementSlot::Plain(e) => e.initialize_per_node(nls),
            ElementSlot::Offloadable(e) => e.initialize_per_node(nls),
        }
    }

    /// Forward `initialize`.
    pub fn initialize(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        match self {
            ElementSlot::Plain(e) => e.initialize(nls),
            ElementSlot::Offloadable(e) => e.initialize(nls),
        }
    }

    /// Forward `process`.
    pub fn process(&mut self, input_port: usize, pkt: &mut Packet) -> Disposition {
        match self {
            ElementSlot::Plain(e) => e.process(input_port, pkt),
            ElementSlot::Offloadable(e) => e.process(input_port, pkt),
        }
    }

    /// Forward `rx_port`.
    pub fn rx_port(&self) -> Option<u16> {
        match self {
            ElementSlot::Plain(e) => e.rx_port(),
            ElementSlot::Offloadable(e) => e.rx_port(),
        }
    }

    /// Forward `tx_port`.
    pub fn tx_port(&self) -> Option<u16> {
        match self {
            ElementSlot::Plain(e) => e.tx_port(),
            ElementSlot::Offloadable(e) => e.tx_port(),
        }
    }

    /// Borrow the offload surface, if any.
    pub fn offloadable(&self) -> Option<&dyn OffloadableElement> {
        match self {
            ElementSlot::Plain(_) => None,
            ElementSlot::Offloadable(e) => Some(e.as_ref()),
        }
    }

    /// Mutably borrow the offload surface, if any.
    pub fn offloadable_mut(&mut self) -> Option<&mut (dyn OffloadableElement + 'static)> {
        match self {
            ElementSlot::Plain(_) => None,
            ElementSlot::Offloadable(e) => Some(e.as_mut()),
        }
    }

    /// Whether this element carries an offload path.
    pub fn is_offloadable(&self) -> bool {
        matches!(self, ElementSlot::Offloadable(_))
    }
}
