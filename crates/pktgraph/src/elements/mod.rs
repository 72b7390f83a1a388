//! Drop-in elements and the class factory the graph builder uses.

pub mod ether;
pub mod ipsec;
pub mod standard;

use crate::element::ElementSlot;
use pktgraph_core::{Error, Result};

/// Instantiate an element by class name.
pub fn create_element(class: &str) -> Result<ElementSlot> {
    match class {
        "FromDevice" => Ok(ElementSlot::Plain(Box::new(standard::FromDevice::new()))),
        "ToDevice" => Ok(ElementSlot::Plain(Box::new(standard::ToDevice::new()))),
        "Discard" => Ok(ElementSlot::Plain(Box::new(standard::Discard::new()))),
        "Identity" => Ok(ElementSlot::Plain(Box::new(standard::Identity::new()))),
        "L2ForwardCreate" => Ok(ElementSlot::Plain(Box::new(ether::L2ForwardCreate::new()))),
        "IPsecAuthHMACSHA1" => Ok(ElementSlot::Offloadable(Box::new(
            ipsec::IPsecAuthHMACSHA1::new(),
        ))),
        other => Err(Error::Config(format!("unknown element class '{}'", other))),
    }
}
