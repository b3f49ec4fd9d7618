//! # Gridforge Network — topology and reachability
//!
//! The simulated plant's network layer: named segments with subnets and
//! VLANs, device memberships (a device may be homed on several segments),
//! a service registry, and the admission gate every protocol listener
//! consults before spawning a session.

pub mod cidr;
pub mod connections;
pub mod gate;
pub mod topology;

pub use cidr::Ipv4Cidr;
pub use connections::{ConnectionLog, SessionRecord};
pub use gate::{Admission, NetworkGate};
pub use topology::Topology;
