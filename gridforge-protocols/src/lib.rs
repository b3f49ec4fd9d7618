//! # Gridforge Protocols — the listening attack surface
//!
//! Real TCP listeners, one per `(device, protocol, port)`. Each listener
//! serves clients out of a **mirror** of its device's memory map so a
//! chatty scanner never contends on the device lock; the orchestrator
//! synchronizes mirror and device once per tick (client writes drain to
//! the device, fresh telemetry pushes back).
//!
//! Modbus TCP is served bit-exact (codec in `modbus`). The secondary
//! protocols — S7, DNP3, IEC-104, OPC UA, EtherNet/IP — expose session
//! registration and their identification handshakes: enough surface for
//! discovery tooling to fingerprint, behind the same admission gate.

pub mod dnp3;
pub mod enip;
pub mod iec104;
pub mod listener;
pub mod mirror;
pub mod modbus;
pub mod opcua;
pub mod s7;

pub use listener::{ProtocolServer, SessionListener};
pub use mirror::{MapMirror, MirrorSizes};
pub use modbus::ModbusTcpListener;
