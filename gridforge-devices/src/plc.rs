//! # Field PLC — per-process housekeeping logic
//!
//! The physics engine owns the process variables; the PLC scan owns the
//! controller-side behavior around them: the scan heartbeat, the comms
//! status bit, and the operator trip-reset path. Memory layout follows
//! the process engine bound to the same device.

use crate::scan::ScanContext;
use gridforge_core::{CoreResult, MemKey, MemValue};
use tracing::{info, warn};

/// Scan heartbeat, increments every cycle.
pub const REG_HEARTBEAT: MemKey = MemKey::input(15);
/// Controller healthy / in RUN mode.
pub const DI_CONTROLLER_OK: MemKey = MemKey::discrete(15);
/// Operator trip-reset request (turbine processes only).
pub const COIL_TRIP_RESET: MemKey = MemKey::coil(12);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Turbine,
    Reactor,
    Hvac,
}

pub struct PlcLogic {
    device: String,
    process: ProcessKind,
    rated_speed_rpm: f64,
    heartbeat: u16,
}

impl PlcLogic {
    pub fn new(device: &str, process: ProcessKind, rated_speed_rpm: f64) -> Self {
        Self {
            device: device.to_string(),
            process,
            rated_speed_rpm,
            heartbeat: 0,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    pub fn scan(&mut self, ctx: &ScanContext) -> CoreResult<()> {
        let snapshot = ctx.fabric.read_bulk(&self.device)?;
        self.heartbeat = self.heartbeat.wrapping_add(1);

        let mut writes = vec![
            (REG_HEARTBEAT, MemValue::Word(self.heartbeat)),
            (DI_CONTROLLER_OK, MemValue::Bit(true)),
        ];

        // Trip reset is only honored once the machine is nearly stopped.
        if self.process == ProcessKind::Turbine && snapshot.bit(COIL_TRIP_RESET) {
            let speed = snapshot.word(gridforge_physics::turbine::REG_SHAFT_SPEED) as f64;
            if speed < self.rated_speed_rpm * 0.1 {
                info!(device = %self.device, "Trip reset accepted");
                writes.push((
                    gridforge_physics::turbine::COIL_EMERGENCY_TRIP,
                    MemValue::Bit(false),
                ));
                writes.push((COIL_TRIP_RESET, MemValue::Bit(false)));
            } else {
                warn!(
                    device = %self.device,
                    speed,
                    "Trip reset refused, shaft speed too high"
                );
                writes.push((COIL_TRIP_RESET, MemValue::Bit(false)));
            }
        }

        ctx.fabric.write_bulk(&self.device, &writes)
    }
}
