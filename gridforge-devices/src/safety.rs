//! # Turbine Safety Controller — independent overspeed protection
//!
//! A separate safety controller watching the turbine through the fabric,
//! exactly as a hardwired SIS would watch the machine through its own
//! sensors. Dual redundant speed/vibration channels with 2oo2 voting,
//! a single-channel bearing-temperature trip, and a manual trip input.
//!
//! The controller's write authority is narrow: on demand it asserts the
//! turbine's trip coil and nothing else — never a setpoint.
//!
//! Memory map (own device):
//! - discrete inputs 0..=7: turbine running, overspeed, high vibration,
//!   high bearing temp, system healthy, trip output active, bypass
//!   active, channel fault
//! - input registers 0..=7: speed A, speed B, vibration A ×10,
//!   vibration B ×10, bearing °C, diagnostic code, demand count,
//!   fault count
//! - coils 0..=2: manual trip, trip reset, bypass enable
//! - holding registers 0..=2: overspeed trip rpm, vibration trip ×10,
//!   bearing trip °C

use crate::scan::ScanContext;
use gridforge_core::{CoreResult, KernelEvent, MemKey, MemValue};
use gridforge_physics::turbine;
use tracing::{error, info, warn};

pub const DI_TURBINE_RUNNING: MemKey = MemKey::discrete(0);
pub const DI_OVERSPEED: MemKey = MemKey::discrete(1);
pub const DI_HIGH_VIBRATION: MemKey = MemKey::discrete(2);
pub const DI_HIGH_BEARING_TEMP: MemKey = MemKey::discrete(3);
pub const DI_SYSTEM_HEALTHY: MemKey = MemKey::discrete(4);
pub const DI_TRIP_ACTIVE: MemKey = MemKey::discrete(5);
pub const DI_BYPASS_ACTIVE: MemKey = MemKey::discrete(6);
pub const DI_CHANNEL_FAULT: MemKey = MemKey::discrete(7);

pub const IR_SPEED_A: MemKey = MemKey::input(0);
pub const IR_SPEED_B: MemKey = MemKey::input(1);
pub const IR_VIBRATION_A: MemKey = MemKey::input(2);
pub const IR_VIBRATION_B: MemKey = MemKey::input(3);
pub const IR_BEARING_TEMP: MemKey = MemKey::input(4);
pub const IR_DIAGNOSTIC: MemKey = MemKey::input(5);
pub const IR_DEMAND_COUNT: MemKey = MemKey::input(6);
pub const IR_FAULT_COUNT: MemKey = MemKey::input(7);

pub const COIL_MANUAL_TRIP: MemKey = MemKey::coil(0);
pub const COIL_TRIP_RESET: MemKey = MemKey::coil(1);
pub const COIL_BYPASS_ENABLE: MemKey = MemKey::coil(2);

pub const HR_OVERSPEED_TRIP_RPM: MemKey = MemKey::holding(0);
pub const HR_VIBRATION_TRIP_X10: MemKey = MemKey::holding(1);
pub const HR_BEARING_TRIP_C: MemKey = MemKey::holding(2);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TurbineSafetyParams {
    pub overspeed_trip_rpm: f64,
    pub vibration_trip_mils: f64,
    pub bearing_trip_c: f64,
    /// Maximum tolerated disagreement between the speed channels,
    /// as a fraction of the overspeed setpoint.
    pub channel_discrepancy_limit: f64,
}

impl Default for TurbineSafetyParams {
    fn default() -> Self {
        Self {
            overspeed_trip_rpm: 3960.0,
            vibration_trip_mils: 10.0,
            bearing_trip_c: 90.0,
            channel_discrepancy_limit: 0.02,
        }
    }
}

pub struct TurbineSafetyLogic {
    device: String,
    turbine: String,
    params: TurbineSafetyParams,
    safe_state_active: bool,
    diagnostic_fault: bool,
    demand_count: u16,
    fault_count: u16,
    setpoints_seeded: bool,
}

impl TurbineSafetyLogic {
    pub fn new(device: &str, turbine: &str, params: TurbineSafetyParams) -> Self {
        Self {
            device: device.to_string(),
            turbine: turbine.to_string(),
            params,
            safe_state_active: false,
            diagnostic_fault: false,
            demand_count: 0,
            fault_count: 0,
            setpoints_seeded: false,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    pub fn is_tripped(&self) -> bool {
        self.safe_state_active
    }

    /// Deterministic per-channel sensor skew (±0.5%), phase-split so the
    /// two channels never read identically but replays stay identical.
    fn channel_pair(base: f64, now: f64) -> (f64, f64) {
        let a = base * (1.0 + 0.005 * (now * 7.3).sin());
        let b = base * (1.0 + 0.005 * (now * 11.1).cos());
        (a, b)
    }

    pub fn scan(&mut self, ctx: &ScanContext) -> CoreResult<()> {
        let own = ctx.fabric.read_bulk(&self.device)?;
        let peer = ctx.fabric.read_bulk(&self.turbine)?;

        // Trip setpoints live in our holding registers so engineers (and
        // attackers) can retune them over the wire. Seed them on first scan.
        if !self.setpoints_seeded {
            ctx.fabric.write_bulk(
                &self.device,
                &[
                    (
                        HR_OVERSPEED_TRIP_RPM,
                        MemValue::Word(self.params.overspeed_trip_rpm as u16),
                    ),
                    (
                        HR_VIBRATION_TRIP_X10,
                        MemValue::Word((self.params.vibration_trip_mils * 10.0) as u16),
                    ),
                    (
                        HR_BEARING_TRIP_C,
                        MemValue::Word(self.params.bearing_trip_c as u16),
                    ),
                ],
            )?;
            self.setpoints_seeded = true;
        }
        let overspeed_trip = if own.get(HR_OVERSPEED_TRIP_RPM).is_some() {
            own.word(HR_OVERSPEED_TRIP_RPM) as f64
        } else {
            self.params.overspeed_trip_rpm
        };
        let vibration_trip = if own.get(HR_VIBRATION_TRIP_X10).is_some() {
            own.word(HR_VIBRATION_TRIP_X10) as f64 / 10.0
        } else {
            self.params.vibration_trip_mils
        };
        let bearing_trip = if own.get(HR_BEARING_TRIP_C).is_some() {
            own.word(HR_BEARING_TRIP_C) as f64
        } else {
            self.params.bearing_trip_c
        };

        // Redundant channels off the turbine telemetry
        let speed = peer.word(turbine::REG_SHAFT_SPEED) as f64;
        let vibration = peer.word(turbine::REG_VIBRATION_X10) as f64 / 10.0;
        let bearing = peer.word(turbine::REG_BEARING_TEMP) as f64;
        let (speed_a, speed_b) = Self::channel_pair(speed, ctx.now);
        let (vib_a, vib_b) = Self::channel_pair(vibration, ctx.now * 1.7);

        // Channel diagnostics
        let speed_limit = overspeed_trip * self.params.channel_discrepancy_limit;
        let mut diagnostic_code = 0u16;
        if (speed_a - speed_b).abs() > speed_limit {
            diagnostic_code = 1;
        } else if (vib_a - vib_b).abs() > 1.0 {
            diagnostic_code = 2;
        }
        if diagnostic_code != 0 && !self.diagnostic_fault {
            self.fault_count = self.fault_count.wrapping_add(1);
            error!(
                device = %self.device,
                code = diagnostic_code,
                "Safety channel discrepancy"
            );
        }
        self.diagnostic_fault = diagnostic_code != 0;

        // Safety functions: 2oo2 on the redundant channels, single channel
        // on bearing temperature, plus the manual trip input.
        let overspeed = speed_a > overspeed_trip && speed_b > overspeed_trip;
        let high_vibration = vib_a > vibration_trip && vib_b > vibration_trip;
        let high_bearing = bearing > bearing_trip;
        let manual = own.bit(COIL_MANUAL_TRIP);

        let mut demand = overspeed || high_vibration || high_bearing || manual;
        let bypass = own.bit(COIL_BYPASS_ENABLE);
        if bypass && demand {
            error!(
                device = %self.device,
                turbine = %self.turbine,
                "SAFETY BYPASS ACTIVE, trip demand suppressed"
            );
            demand = false;
        }

        if demand && !self.safe_state_active {
            self.safe_state_active = true;
            self.demand_count = self.demand_count.wrapping_add(1);
            warn!(
                device = %self.device,
                turbine = %self.turbine,
                speed_a,
                speed_b,
                overspeed,
                high_vibration,
                high_bearing,
                manual,
                "Safety demand, tripping turbine"
            );
            ctx.events.publish(KernelEvent::OverspeedTrip {
                device: self.turbine.clone(),
                speed_rpm: speed_a.max(speed_b),
                trip_rpm: overspeed_trip,
            });
        }

        // The one write this controller is authorized to make on its peer.
        if self.safe_state_active && !bypass {
            ctx.fabric.write(
                &self.turbine,
                turbine::COIL_EMERGENCY_TRIP,
                MemValue::Bit(true),
            )?;
        }

        // Reset path: only once the demand has cleared and the machine is
        // essentially stopped.
        if own.bit(COIL_TRIP_RESET) {
            let mut clears = vec![(COIL_TRIP_RESET, MemValue::Bit(false))];
            if self.safe_state_active && !overspeed && !high_vibration && speed < 100.0 {
                self.safe_state_active = false;
                info!(device = %self.device, "Safe state reset");
                clears.push((COIL_MANUAL_TRIP, MemValue::Bit(false)));
            }
            ctx.fabric.write_bulk(&self.device, &clears)?;
        }

        ctx.fabric.write_bulk(
            &self.device,
            &[
                (DI_TURBINE_RUNNING, MemValue::Bit(peer.bit(turbine::COIL_RUNNING))),
                (DI_OVERSPEED, MemValue::Bit(overspeed)),
                (DI_HIGH_VIBRATION, MemValue::Bit(high_vibration)),
                (DI_HIGH_BEARING_TEMP, MemValue::Bit(high_bearing)),
                (DI_SYSTEM_HEALTHY, MemValue::Bit(!self.diagnostic_fault)),
                (DI_TRIP_ACTIVE, MemValue::Bit(self.safe_state_active)),
                (DI_BYPASS_ACTIVE, MemValue::Bit(bypass)),
                (DI_CHANNEL_FAULT, MemValue::Bit(self.diagnostic_fault)),
                (IR_SPEED_A, MemValue::Word(speed_a.clamp(0.0, 65535.0) as u16)),
                (IR_SPEED_B, MemValue::Word(speed_b.clamp(0.0, 65535.0) as u16)),
                (IR_VIBRATION_A, MemValue::Word((vib_a * 10.0).clamp(0.0, 65535.0) as u16)),
                (IR_VIBRATION_B, MemValue::Word((vib_b * 10.0).clamp(0.0, 65535.0) as u16)),
                (IR_BEARING_TEMP, MemValue::Word(bearing.clamp(0.0, 65535.0) as u16)),
                (IR_DIAGNOSTIC, MemValue::Word(diagnostic_code)),
                (IR_DEMAND_COUNT, MemValue::Word(self.demand_count)),
                (IR_FAULT_COUNT, MemValue::Word(self.fault_count)),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanContext;
    use gridforge_core::{DeviceKind, EventKind, EventLog, SimClock, StateFabric};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn world() -> (Arc<StateFabric>, Arc<EventLog>) {
        let clock = SimClock::stepped();
        let fabric = StateFabric::new(clock.clone());
        let events = EventLog::new(clock);
        for (name, kind) in [
            ("turbine_plc_1", DeviceKind::Plc),
            ("turbine_sis_1", DeviceKind::Sis),
        ] {
            fabric
                .register(name, kind, 1, vec!["modbus".into()], HashMap::new())
                .unwrap();
        }
        (fabric, events)
    }

    fn set_turbine(fabric: &StateFabric, rpm: u16, vib_x10: u16, bearing: u16) {
        fabric
            .write_bulk(
                "turbine_plc_1",
                &[
                    (turbine::REG_SHAFT_SPEED, MemValue::Word(rpm)),
                    (turbine::REG_VIBRATION_X10, MemValue::Word(vib_x10)),
                    (turbine::REG_BEARING_TEMP, MemValue::Word(bearing)),
                    (turbine::COIL_RUNNING, MemValue::Bit(rpm > 100)),
                ],
            )
            .unwrap();
    }

    fn scan(logic: &mut TurbineSafetyLogic, fabric: &StateFabric, events: &EventLog, now: f64) {
        let ctx = ScanContext { fabric, events, now };
        logic.scan(&ctx).unwrap();
    }

    #[test]
    fn test_no_demand_at_rated_speed() {
        let (fabric, events) = world();
        let mut sis = TurbineSafetyLogic::new(
            "turbine_sis_1",
            "turbine_plc_1",
            TurbineSafetyParams::default(),
        );
        set_turbine(&fabric, 3600, 20, 60);
        scan(&mut sis, &fabric, &events, 0.05);
        assert!(!sis.is_tripped());
        let peer = fabric.read_bulk("turbine_plc_1").unwrap();
        assert!(!peer.bit(turbine::COIL_EMERGENCY_TRIP));
        let own = fabric.read_bulk("turbine_sis_1").unwrap();
        assert!(own.bit(DI_SYSTEM_HEALTHY));
        assert_eq!(own.word(HR_OVERSPEED_TRIP_RPM), 3960);
    }

    #[test]
    fn test_overspeed_demand_asserts_peer_trip_only() {
        let (fabric, events) = world();
        let mut sis = TurbineSafetyLogic::new(
            "turbine_sis_1",
            "turbine_plc_1",
            TurbineSafetyParams::default(),
        );
        // Write a setpoint onto the turbine so we can prove the SIS never
        // touches it.
        fabric
            .write_bulk(
                "turbine_plc_1",
                &[(turbine::REG_SPEED_SETPOINT, MemValue::Word(4500))],
            )
            .unwrap();
        set_turbine(&fabric, 4100, 30, 70);
        scan(&mut sis, &fabric, &events, 0.05);

        assert!(sis.is_tripped());
        let peer = fabric.read_bulk("turbine_plc_1").unwrap();
        assert!(peer.bit(turbine::COIL_EMERGENCY_TRIP));
        assert_eq!(
            peer.word(turbine::REG_SPEED_SETPOINT),
            4500,
            "the SIS must never write a setpoint"
        );
        let own = fabric.read_bulk("turbine_sis_1").unwrap();
        assert!(own.bit(DI_OVERSPEED));
        assert!(own.bit(DI_TRIP_ACTIVE));
        assert_eq!(own.word(IR_DEMAND_COUNT), 1);
    }

    #[test]
    fn test_demand_latches_until_reset_conditions() {
        let (fabric, events) = world();
        let mut sis = TurbineSafetyLogic::new(
            "turbine_sis_1",
            "turbine_plc_1",
            TurbineSafetyParams::default(),
        );
        set_turbine(&fabric, 4100, 30, 70);
        scan(&mut sis, &fabric, &events, 0.05);
        assert!(sis.is_tripped());

        // Speed back at rated: still latched, reset refused at speed
        set_turbine(&fabric, 3600, 20, 60);
        fabric
            .write("turbine_sis_1", COIL_TRIP_RESET, MemValue::Bit(true))
            .unwrap();
        scan(&mut sis, &fabric, &events, 0.10);
        assert!(sis.is_tripped());

        // Stopped: reset accepted
        set_turbine(&fabric, 0, 20, 30);
        fabric
            .write("turbine_sis_1", COIL_TRIP_RESET, MemValue::Bit(true))
            .unwrap();
        scan(&mut sis, &fabric, &events, 0.15);
        assert!(!sis.is_tripped());
    }

    #[test]
    fn test_manual_trip_coil() {
        let (fabric, events) = world();
        let mut sis = TurbineSafetyLogic::new(
            "turbine_sis_1",
            "turbine_plc_1",
            TurbineSafetyParams::default(),
        );
        set_turbine(&fabric, 3000, 20, 60);
        fabric
            .write("turbine_sis_1", COIL_MANUAL_TRIP, MemValue::Bit(true))
            .unwrap();
        scan(&mut sis, &fabric, &events, 0.05);
        assert!(sis.is_tripped());
        assert!(fabric
            .read("turbine_plc_1", turbine::COIL_EMERGENCY_TRIP)
            .unwrap()
            .unwrap()
            .as_bit()
            .unwrap());
    }

    #[test]
    fn test_trip_event_emitted_by_safety_logic_alone() {
        let (fabric, events) = world();
        let mut sis = TurbineSafetyLogic::new(
            "turbine_sis_1",
            "turbine_plc_1",
            TurbineSafetyParams::default(),
        );
        // 3500 rpm is below the machine's own 3960 alarm point, so the
        // turbine-side overspeed latch never fires here
        set_turbine(&fabric, 3500, 20, 60);
        scan(&mut sis, &fabric, &events, 0.05);
        assert!(!sis.is_tripped());
        assert_eq!(events.count(EventKind::OverspeedTrip), 0);

        // Retune this controller's trip setpoint below the running speed
        fabric
            .write("turbine_sis_1", HR_OVERSPEED_TRIP_RPM, MemValue::Word(3000))
            .unwrap();
        scan(&mut sis, &fabric, &events, 0.10);
        assert!(sis.is_tripped());
        assert_eq!(events.count(EventKind::OverspeedTrip), 1);
        let record = &events.recent(1, Some(EventKind::OverspeedTrip))[0];
        match &record.event {
            KernelEvent::OverspeedTrip {
                device,
                speed_rpm,
                trip_rpm,
            } => {
                assert_eq!(device, "turbine_plc_1");
                assert!(*speed_rpm > 3000.0);
                assert_eq!(*trip_rpm, 3000.0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Latched demand does not re-publish on subsequent scans
        scan(&mut sis, &fabric, &events, 0.15);
        assert_eq!(events.count(EventKind::OverspeedTrip), 1);
    }

    #[test]
    fn test_bypass_suppresses_demand() {
        let (fabric, events) = world();
        let mut sis = TurbineSafetyLogic::new(
            "turbine_sis_1",
            "turbine_plc_1",
            TurbineSafetyParams::default(),
        );
        set_turbine(&fabric, 4200, 30, 70);
        fabric
            .write("turbine_sis_1", COIL_BYPASS_ENABLE, MemValue::Bit(true))
            .unwrap();
        scan(&mut sis, &fabric, &events, 0.05);
        assert!(!sis.is_tripped());
        let peer = fabric.read_bulk("turbine_plc_1").unwrap();
        assert!(!peer.bit(turbine::COIL_EMERGENCY_TRIP));
        let own = fabric.read_bulk("turbine_sis_1").unwrap();
        assert!(own.bit(DI_BYPASS_ACTIVE));
    }

    #[test]
    fn test_retuned_trip_setpoint_is_honored() {
        let (fabric, events) = world();
        let mut sis = TurbineSafetyLogic::new(
            "turbine_sis_1",
            "turbine_plc_1",
            TurbineSafetyParams::default(),
        );
        set_turbine(&fabric, 3600, 20, 60);
        scan(&mut sis, &fabric, &events, 0.05);
        // An attacker raises the overspeed setpoint to 5000 rpm
        fabric
            .write("turbine_sis_1", HR_OVERSPEED_TRIP_RPM, MemValue::Word(5000))
            .unwrap();
        set_turbine(&fabric, 4500, 30, 70);
        scan(&mut sis, &fabric, &events, 0.10);
        assert!(
            !sis.is_tripped(),
            "4500 rpm must not trip once the setpoint was retuned to 5000"
        );
    }
}
