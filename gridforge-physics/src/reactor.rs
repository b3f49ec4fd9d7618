//! # Reactor — thermal mass, kinetics, field stability, containment
//!
//! Control inputs:
//! - `holding_registers[10]` — power setpoint, % of rated
//! - `holding_registers[11]` — coolant pump speed, %
//! - `holding_registers[12]` — rod withdrawal, % (0 = fully inserted)
//! - `coils[10]` — SCRAM command
//! - `coils[11]` — field stabilizer enable
//!
//! Hard interlock: core temperature at or past critical, or containment
//! integrity below half, forces an automatic SCRAM regardless of commands.
//! A containment breach is terminal — the engine latches failed and only
//! decays from there.

use crate::{word, PhysicsEngine};
use gridforge_core::{CoreResult, KernelEvent, MemKey, MemValue, StateFabric};
use tracing::{debug, error, warn};

pub const REG_CORE_TEMP: MemKey = MemKey::holding(0);
pub const REG_COOLANT_TEMP: MemKey = MemKey::holding(1);
pub const REG_PRESSURE_X10: MemKey = MemKey::holding(2);
pub const REG_POWER_X10: MemKey = MemKey::holding(3);
pub const REG_FIELD_PCT: MemKey = MemKey::holding(4);
pub const REG_REACTION_PCT: MemKey = MemKey::holding(5);
pub const REG_PUMP_PCT: MemKey = MemKey::holding(6);
pub const REG_CONTAINMENT_PCT: MemKey = MemKey::holding(7);
pub const REG_OVERTEMP_SECS: MemKey = MemKey::holding(8);
pub const REG_DAMAGE_PCT: MemKey = MemKey::holding(9);

pub const COIL_ACTIVE: MemKey = MemKey::coil(0);
pub const COIL_HIGH_TEMP: MemKey = MemKey::coil(1);
pub const COIL_HIGH_PRESSURE: MemKey = MemKey::coil(2);
pub const COIL_FIELD_WARNING: MemKey = MemKey::coil(3);
pub const COIL_CONTAINMENT_WARNING: MemKey = MemKey::coil(4);
pub const COIL_SCRAM_ACTIVE: MemKey = MemKey::coil(5);
pub const COIL_SEVERE_DAMAGE: MemKey = MemKey::coil(6);

pub const REG_POWER_SETPOINT: MemKey = MemKey::holding(10);
pub const REG_PUMP_COMMAND: MemKey = MemKey::holding(11);
pub const REG_ROD_POSITION: MemKey = MemKey::holding(12);
pub const COIL_SCRAM_COMMAND: MemKey = MemKey::coil(10);
pub const COIL_STABILIZER_ENABLE: MemKey = MemKey::coil(11);

const AMBIENT_C: f64 = 25.0;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReactorParams {
    pub rated_power_mw: f64,
    pub rated_temperature_c: f64,
    pub max_safe_temperature_c: f64,
    pub critical_temperature_c: f64,
    pub max_safe_pressure_bar: f64,
    /// Thermal inertia, MJ/°C.
    pub thermal_mass: f64,
    /// Cooling capacity, MW per °C of core/coolant difference at full flow.
    pub coolant_capacity: f64,
    /// First-order lag of reaction-rate changes, seconds.
    pub reaction_tau_s: f64,
    pub field_decay_rate: f64,
    pub field_recovery_rate: f64,
}

impl Default for ReactorParams {
    fn default() -> Self {
        Self {
            rated_power_mw: 25.0,
            rated_temperature_c: 350.0,
            max_safe_temperature_c: 400.0,
            critical_temperature_c: 450.0,
            max_safe_pressure_bar: 150.0,
            thermal_mass: 50.0,
            coolant_capacity: 0.5,
            reaction_tau_s: 10.0,
            field_decay_rate: 0.01,
            field_recovery_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReactorState {
    pub core_temp_c: f64,
    pub coolant_temp_c: f64,
    pub vessel_pressure_bar: f64,
    pub coolant_flow: f64,
    pub reaction_rate: f64,
    pub power_mw: f64,
    /// Field stability, 1.0 = fully stable.
    pub field_strength: f64,
    pub containment_integrity: f64,
    pub overtemp_accumulated_s: f64,
    pub damage: f64,
}

impl Default for ReactorState {
    fn default() -> Self {
        Self {
            core_temp_c: AMBIENT_C,
            coolant_temp_c: AMBIENT_C,
            vessel_pressure_bar: 1.0,
            coolant_flow: 0.0,
            reaction_rate: 0.0,
            power_mw: 0.0,
            field_strength: 1.0,
            containment_integrity: 1.0,
            overtemp_accumulated_s: 0.0,
            damage: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ReactorControls {
    power_setpoint_pct: f64,
    pump_pct: f64,
    rod_withdrawal_pct: f64,
    scram_command: bool,
    stabilizer_enabled: bool,
}

pub struct ReactorPhysics {
    device: String,
    params: ReactorParams,
    state: ReactorState,
    controls: ReactorControls,
    scram_active: bool,
    breached: bool,
    /// Deterministic phase accumulator driving instability flutter.
    phase: f64,
    events: Vec<KernelEvent>,
}

impl ReactorPhysics {
    pub fn new(device: &str, params: ReactorParams) -> Self {
        Self {
            device: device.to_string(),
            params,
            state: ReactorState::default(),
            controls: ReactorControls {
                rod_withdrawal_pct: 0.0,
                stabilizer_enabled: true,
                ..Default::default()
            },
            scram_active: false,
            breached: false,
            phase: 0.0,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> &ReactorState {
        &self.state
    }

    pub fn is_scram_active(&self) -> bool {
        self.scram_active
    }

    /// Clear the SCRAM latch. Refused while the core is hot, the field is
    /// unsettled, or containment is degraded.
    pub fn reset_scram(&mut self) -> bool {
        if self.breached {
            return false;
        }
        if self.state.core_temp_c < self.params.rated_temperature_c
            && self.state.field_strength > 0.8
            && self.state.containment_integrity > 0.9
        {
            self.scram_active = false;
            true
        } else {
            warn!(device = %self.device, "SCRAM reset refused, conditions not safe");
            false
        }
    }

    fn scram_update(&mut self, dt: f64) {
        // Rods drive in: reaction rate halves every two seconds.
        self.state.reaction_rate *= 0.5_f64.powf(dt / 2.0);
        if self.state.reaction_rate < 0.001 {
            self.state.reaction_rate = 0.0;
        }
        let decay_heat = self.state.reaction_rate * self.params.rated_power_mw * 0.07;
        self.state.coolant_flow = 1.0;

        let temp_diff = self.state.core_temp_c - AMBIENT_C;
        let cooling = self.params.coolant_capacity * temp_diff - decay_heat;
        self.state.core_temp_c -= (cooling.max(0.0) * dt / self.params.thermal_mass).max(0.0);
        self.state.core_temp_c = self.state.core_temp_c.max(AMBIENT_C);

        // Rods remove the power stress, but residual heat still works on
        // the field and a collapsed field keeps eroding containment.
        let temp_stress = ((self.state.core_temp_c - self.params.rated_temperature_c)
            / 100.0)
            .max(0.0);
        let stress = temp_stress * 0.5;
        let (recovery, decay) = if self.controls.stabilizer_enabled {
            (
                self.params.field_recovery_rate * dt,
                stress * self.params.field_decay_rate * dt * 0.5,
            )
        } else {
            (
                self.params.field_recovery_rate * dt * 0.2,
                stress * self.params.field_decay_rate * dt * 4.0,
            )
        };
        self.state.field_strength =
            (self.state.field_strength + recovery - decay).clamp(0.0, 1.0);
        self.erode_containment(dt);
    }

    fn update_reaction(&mut self, dt: f64) {
        let setpoint = self.controls.power_setpoint_pct.clamp(0.0, 100.0);
        let rods = self.controls.rod_withdrawal_pct.clamp(0.0, 100.0);

        // Rods physically cap the achievable reaction.
        let mut target = (setpoint / 100.0).min(rods / 100.0);

        // Instability flutter once the field sags; phase-driven and fully
        // deterministic so stepped replays stay bit-identical.
        if self.state.field_strength < 0.8 {
            let instability = 1.0 - self.state.field_strength;
            target *= 1.0 + (self.phase * 2.0).sin() * instability * 0.2;
        }

        self.state.reaction_rate +=
            (target - self.state.reaction_rate) * (dt / self.params.reaction_tau_s);
        self.state.reaction_rate = self.state.reaction_rate.clamp(0.0, 1.5);
    }

    fn update_thermals(&mut self, dt: f64) {
        self.state.coolant_flow = self.controls.pump_pct.clamp(0.0, 100.0) / 100.0;

        let heat_generated = self.state.reaction_rate * self.params.rated_power_mw;
        let temp_diff = (self.state.core_temp_c - self.state.coolant_temp_c).max(0.0);
        let heat_removed = self.state.coolant_flow * self.params.coolant_capacity * temp_diff;

        self.state.core_temp_c +=
            (heat_generated - heat_removed) * dt / self.params.thermal_mass;

        if self.state.coolant_flow > 0.01 {
            let coolant_target = AMBIENT_C + (self.state.core_temp_c - AMBIENT_C) * 0.3;
            self.state.coolant_temp_c +=
                (coolant_target - self.state.coolant_temp_c) * 0.1 * dt;
        } else {
            self.state.coolant_temp_c +=
                (self.state.core_temp_c - self.state.coolant_temp_c) * 0.01 * dt;
        }

        if self.state.core_temp_c < 30.0 && self.state.reaction_rate < 0.01 {
            self.state.core_temp_c += (AMBIENT_C - self.state.core_temp_c) * 0.01 * dt;
        }
        self.state.core_temp_c = self.state.core_temp_c.max(AMBIENT_C);
        self.state.coolant_temp_c = self.state.coolant_temp_c.max(AMBIENT_C);
    }

    fn update_pressure(&mut self) {
        let span = self.params.max_safe_pressure_bar - 1.0;
        let fraction = (self.state.core_temp_c - AMBIENT_C)
            / (self.params.rated_temperature_c - AMBIENT_C);
        self.state.vessel_pressure_bar = (1.0 + span * fraction).max(1.0);
        if self.state.field_strength < 0.7 {
            let instability = 1.0 - self.state.field_strength;
            self.state.vessel_pressure_bar += (self.phase * 3.0).sin() * instability * 10.0;
            self.state.vessel_pressure_bar = self.state.vessel_pressure_bar.max(1.0);
        }
    }

    fn update_field(&mut self, dt: f64) {
        let power_stress = self.state.reaction_rate;
        let temp_stress = ((self.state.core_temp_c - self.params.rated_temperature_c)
            / 100.0)
            .max(0.0);
        let stress = power_stress * 0.3 + temp_stress * 0.5;

        let (recovery, decay) = if self.controls.stabilizer_enabled {
            (
                self.params.field_recovery_rate * dt,
                stress * self.params.field_decay_rate * dt * 0.5,
            )
        } else {
            (
                self.params.field_recovery_rate * dt * 0.2,
                stress * self.params.field_decay_rate * dt * 4.0,
            )
        };
        self.state.field_strength =
            (self.state.field_strength + recovery - decay).clamp(0.0, 1.0);
        self.erode_containment(dt);
    }

    /// A collapsed field chews through containment until it rebuilds past
    /// the 0.3 floor. Runs in every branch, SCRAM included — rods stop
    /// the reaction, not an instability already in progress.
    fn erode_containment(&mut self, dt: f64) {
        if self.state.field_strength >= 0.3 {
            return;
        }
        let erosion = (0.3 - self.state.field_strength) * 0.1 * dt;
        self.state.containment_integrity =
            (self.state.containment_integrity - erosion).max(0.0);
        warn!(
            device = %self.device,
            field = self.state.field_strength,
            containment = self.state.containment_integrity,
            "Field instability eroding containment"
        );
    }

    fn update_power(&mut self) {
        let efficiency = if self.state.core_temp_c > self.params.max_safe_temperature_c {
            0.8
        } else if self.state.core_temp_c < 100.0 {
            0.5
        } else {
            1.0
        };
        self.state.power_mw =
            self.state.reaction_rate * self.params.rated_power_mw * efficiency;
    }

    fn update_damage(&mut self, dt: f64) {
        if self.state.core_temp_c <= self.params.max_safe_temperature_c {
            return;
        }
        self.state.overtemp_accumulated_s += dt;
        let overtemp = self.state.core_temp_c - self.params.max_safe_temperature_c;
        self.state.damage = (self.state.damage + overtemp / 100.0 * 0.01 * dt).min(1.0);
    }
}

impl PhysicsEngine for ReactorPhysics {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn read_controls(&mut self, fabric: &StateFabric) -> CoreResult<()> {
        let snapshot = fabric.read_bulk(&self.device)?;
        self.controls = ReactorControls {
            power_setpoint_pct: snapshot.word(REG_POWER_SETPOINT) as f64,
            pump_pct: snapshot.word(REG_PUMP_COMMAND) as f64,
            rod_withdrawal_pct: snapshot.word(REG_ROD_POSITION) as f64,
            scram_command: snapshot.bit(COIL_SCRAM_COMMAND),
            // Stabilizer is normally-on: an absent coil means nobody has
            // commanded it off yet
            stabilizer_enabled: snapshot
                .get(COIL_STABILIZER_ENABLE)
                .and_then(|v| v.as_bit())
                .unwrap_or(true),
        };
        Ok(())
    }

    fn update(&mut self, dt: f64) {
        if dt <= 0.0 {
            warn!(device = %self.device, dt, "Invalid time delta, skipping update");
            return;
        }
        self.phase += dt;

        if self.breached {
            self.scram_update(dt);
            self.update_pressure();
            self.state.power_mw = 0.0;
            return;
        }

        if self.controls.scram_command && !self.scram_active {
            self.scram_active = true;
            self.events.push(KernelEvent::ReactorScram {
                device: self.device.clone(),
                core_temp_c: self.state.core_temp_c,
            });
        }

        // Hard interlock, independent of any command path.
        if !self.scram_active
            && (self.state.core_temp_c >= self.params.critical_temperature_c
                || self.state.containment_integrity < 0.5)
        {
            warn!(
                device = %self.device,
                core_temp = self.state.core_temp_c,
                containment = self.state.containment_integrity,
                "Auto-SCRAM interlock tripped"
            );
            self.scram_active = true;
            self.events.push(KernelEvent::ReactorScram {
                device: self.device.clone(),
                core_temp_c: self.state.core_temp_c,
            });
        }

        if self.scram_active {
            self.scram_update(dt);
            self.update_pressure();
            self.update_power();
        } else {
            self.update_reaction(dt);
            self.update_thermals(dt);
            self.update_pressure();
            self.update_field(dt);
            self.update_power();
            self.update_damage(dt);
        }

        // Terminal state, reachable from either branch: the interlock
        // latches well before integrity runs out, but erosion continues
        // through the SCRAM while the field is down.
        if self.state.containment_integrity <= 0.0 {
            error!(device = %self.device, "CONTAINMENT BREACH");
            self.breached = true;
            self.state.power_mw = 0.0;
            self.events.push(KernelEvent::ContainmentBreach {
                device: self.device.clone(),
            });
        }

        debug!(
            device = %self.device,
            core_temp = self.state.core_temp_c,
            power_mw = self.state.power_mw,
            field = self.state.field_strength,
            "Reactor updated"
        );
    }

    fn write_telemetry(&self, fabric: &StateFabric) -> CoreResult<()> {
        let s = &self.state;
        let p = &self.params;
        let words = [
            word(s.core_temp_c),
            word(s.coolant_temp_c),
            word(s.vessel_pressure_bar * 10.0),
            word(s.power_mw * 10.0),
            word(s.field_strength * 100.0),
            word(s.reaction_rate * 100.0),
            word(s.coolant_flow * 100.0),
            word(s.containment_integrity * 100.0),
            word(s.overtemp_accumulated_s),
            word(s.damage * 100.0),
        ];
        let status = [
            s.reaction_rate > 0.01,
            s.core_temp_c > p.max_safe_temperature_c,
            s.vessel_pressure_bar > p.max_safe_pressure_bar,
            s.field_strength < 0.5,
            s.containment_integrity < 0.8,
            self.scram_active,
            s.damage > 0.5 || self.breached,
        ];
        let mut writes = Vec::with_capacity(words.len() * 2 + status.len() * 2);
        for (i, w) in words.iter().enumerate() {
            writes.push((MemKey::holding(i as u16), MemValue::Word(*w)));
            writes.push((MemKey::input(i as u16), MemValue::Word(*w)));
        }
        for (i, b) in status.iter().enumerate() {
            writes.push((MemKey::coil(i as u16), MemValue::Bit(*b)));
            writes.push((MemKey::discrete(i as u16), MemValue::Bit(*b)));
        }
        fabric.write_bulk(&self.device, &writes)
    }

    fn drain_events(&mut self) -> Vec<KernelEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridforge_core::{DeviceKind, SimClock};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn setup() -> (Arc<StateFabric>, ReactorPhysics) {
        let fabric = StateFabric::new(SimClock::stepped());
        fabric
            .register(
                "reactor_plc_1",
                DeviceKind::Plc,
                2,
                vec!["modbus".into()],
                HashMap::new(),
            )
            .unwrap();
        let reactor = ReactorPhysics::new("reactor_plc_1", ReactorParams::default());
        reactor.write_telemetry(&fabric).unwrap();
        (fabric, reactor)
    }

    fn run(reactor: &mut ReactorPhysics, fabric: &StateFabric, seconds: f64, dt: f64) {
        let steps = (seconds / dt).round() as usize;
        for _ in 0..steps {
            reactor.read_controls(fabric).unwrap();
            reactor.update(dt);
            reactor.write_telemetry(fabric).unwrap();
        }
    }

    fn command_power(fabric: &StateFabric, setpoint: u16, rods: u16, pump: u16) {
        fabric
            .write_bulk(
                "reactor_plc_1",
                &[
                    (REG_POWER_SETPOINT, MemValue::Word(setpoint)),
                    (REG_ROD_POSITION, MemValue::Word(rods)),
                    (REG_PUMP_COMMAND, MemValue::Word(pump)),
                    (COIL_STABILIZER_ENABLE, MemValue::Bit(true)),
                ],
            )
            .unwrap();
    }

    #[test]
    fn test_power_ascension() {
        let (fabric, mut reactor) = setup();
        command_power(&fabric, 80, 80, 60);
        run(&mut reactor, &fabric, 600.0, 0.1);
        assert!(reactor.state().reaction_rate > 0.7);
        assert!(reactor.state().power_mw > 10.0);
        assert!(reactor.state().core_temp_c > 100.0);
        let snap = fabric.read_bulk("reactor_plc_1").unwrap();
        assert!(snap.bit(COIL_ACTIVE));
        assert!(!snap.bit(COIL_SCRAM_ACTIVE));
    }

    #[test]
    fn test_rods_cap_reaction() {
        let (fabric, mut reactor) = setup();
        // Setpoint 100% but rods only 20% withdrawn
        command_power(&fabric, 100, 20, 80);
        run(&mut reactor, &fabric, 120.0, 0.1);
        assert!(reactor.state().reaction_rate <= 0.25);
    }

    #[test]
    fn test_commanded_scram_latches_and_emits_once() {
        let (fabric, mut reactor) = setup();
        command_power(&fabric, 50, 50, 50);
        run(&mut reactor, &fabric, 30.0, 0.1);
        fabric
            .write("reactor_plc_1", COIL_SCRAM_COMMAND, MemValue::Bit(true))
            .unwrap();
        run(&mut reactor, &fabric, 10.0, 0.1);
        assert!(reactor.is_scram_active());
        assert!(reactor.state().reaction_rate < 0.05);
        let scrams: Vec<_> = reactor
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, KernelEvent::ReactorScram { .. }))
            .collect();
        assert_eq!(scrams.len(), 1);
        let snap = fabric.read_bulk("reactor_plc_1").unwrap();
        assert!(snap.bit(COIL_SCRAM_ACTIVE));
    }

    #[test]
    fn test_auto_scram_on_critical_temperature() {
        let (fabric, mut reactor) = setup();
        // Full power, no coolant: the core runs away until the interlock acts
        command_power(&fabric, 100, 100, 0);
        run(&mut reactor, &fabric, 1200.0, 0.1);
        assert!(reactor.is_scram_active());
        assert!(
            reactor.state().core_temp_c < ReactorParams::default().critical_temperature_c + 60.0
        );
        assert!(reactor
            .drain_events()
            .iter()
            .any(|e| matches!(e, KernelEvent::ReactorScram { .. })));
    }

    #[test]
    fn test_scram_reset_refused_while_hot() {
        let (fabric, mut reactor) = setup();
        command_power(&fabric, 100, 100, 0);
        run(&mut reactor, &fabric, 1200.0, 0.1);
        assert!(reactor.is_scram_active());
        // Immediately after the trip the core is still near critical
        if reactor.state().core_temp_c >= ReactorParams::default().rated_temperature_c {
            assert!(!reactor.reset_scram());
        }
        // After a long cooldown the reset is accepted
        run(&mut reactor, &fabric, 3000.0, 0.5);
        assert!(reactor.reset_scram());
    }

    #[test]
    fn test_containment_breach_is_terminal() {
        let (fabric, mut reactor) = setup();
        fabric
            .write_bulk(
                "reactor_plc_1",
                &[
                    (REG_PUMP_COMMAND, MemValue::Word(0)),
                    (COIL_STABILIZER_ENABLE, MemValue::Bit(false)),
                ],
            )
            .unwrap();
        // Collapsed field, hot core, vessel already degraded: the
        // interlock SCRAMs on the first tick, but with the stabilizer off
        // the field stays down long enough to finish off containment.
        reactor.state.core_temp_c = 430.0;
        reactor.state.field_strength = 0.05;
        reactor.state.containment_integrity = 0.45;
        run(&mut reactor, &fabric, 60.0, 0.1);

        let events = reactor.drain_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, KernelEvent::ReactorScram { .. }))
                .count(),
            1
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, KernelEvent::ContainmentBreach { .. }))
                .count(),
            1
        );
        assert_eq!(reactor.state().containment_integrity, 0.0);
        assert_eq!(reactor.state().power_mw, 0.0);
        assert!(reactor.is_scram_active());
        // Breached is forever: no reset, even after cooling down
        run(&mut reactor, &fabric, 600.0, 0.5);
        assert!(!reactor.reset_scram());
        let snap = fabric.read_bulk("reactor_plc_1").unwrap();
        assert!(snap.bit(COIL_SEVERE_DAMAGE));
        assert!(snap.bit(COIL_SCRAM_ACTIVE));
        assert_eq!(snap.word(REG_CONTAINMENT_PCT), 0);
    }

    #[test]
    fn test_field_decays_without_stabilizer() {
        let (fabric, mut reactor) = setup();
        fabric
            .write_bulk(
                "reactor_plc_1",
                &[
                    (REG_POWER_SETPOINT, MemValue::Word(100)),
                    (REG_ROD_POSITION, MemValue::Word(100)),
                    (REG_PUMP_COMMAND, MemValue::Word(100)),
                    (COIL_STABILIZER_ENABLE, MemValue::Bit(false)),
                ],
            )
            .unwrap();
        run(&mut reactor, &fabric, 300.0, 0.1);
        assert!(
            reactor.state().field_strength < 0.9,
            "field {} should sag without the stabilizer",
            reactor.state().field_strength
        );
    }
}
