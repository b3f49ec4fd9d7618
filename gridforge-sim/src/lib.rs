//! # Gridforge Sim — the assembled range
//!
//! Wires clock, fabric, physics, scan machines, listeners, and the
//! network gate into one causally ordered runtime, and ships the demo
//! plant catalogue the CLI boots.

pub mod catalogue;
pub mod orchestrator;

pub use catalogue::demo_plant;
pub use orchestrator::{Orchestrator, PlantParts};
