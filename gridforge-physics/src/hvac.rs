//! # HVAC — zone climate dynamics with a dimensional-stability index
//!
//! Control inputs:
//! - `holding_registers[10]` — temperature setpoint, °C
//! - `holding_registers[11]` — humidity setpoint, %RH
//! - `holding_registers[12]` — fan speed command, %
//! - `holding_registers[13]` — mode: 0 off, 1 heat, 2 cool, 3 auto
//! - `holding_registers[14]` — outside-air damper command, %
//! - `coils[10]` — system enable
//! - `coils[11]` — stability dampener enable
//!
//! The stability index (`holding_registers[4]`, %) decays while the zone
//! is outside its temperature/humidity band and rebuilds inside it. It is
//! a diagnostic for the archive zone the system conditions, not a physical
//! quantity.

use crate::{word, PhysicsEngine};
use gridforge_core::{CoreResult, MemKey, MemValue, StateFabric};
use tracing::{debug, warn};

pub const REG_ZONE_TEMP: MemKey = MemKey::holding(0);
pub const REG_ZONE_HUMIDITY: MemKey = MemKey::holding(1);
pub const REG_SUPPLY_TEMP: MemKey = MemKey::holding(2);
pub const REG_DUCT_PRESSURE: MemKey = MemKey::holding(3);
pub const REG_STABILITY_PCT: MemKey = MemKey::holding(4);
pub const REG_FAN_PCT: MemKey = MemKey::holding(5);
pub const REG_ENERGY_KW: MemKey = MemKey::holding(6);

pub const COIL_RUNNING: MemKey = MemKey::coil(0);
pub const COIL_TEMP_OUT_OF_BAND: MemKey = MemKey::coil(1);
pub const COIL_HUMIDITY_OUT_OF_BAND: MemKey = MemKey::coil(2);
pub const COIL_STABILITY_WARNING: MemKey = MemKey::coil(3);

pub const REG_TEMP_SETPOINT: MemKey = MemKey::holding(10);
pub const REG_HUMIDITY_SETPOINT: MemKey = MemKey::holding(11);
pub const REG_FAN_COMMAND: MemKey = MemKey::holding(12);
pub const REG_MODE: MemKey = MemKey::holding(13);
pub const REG_DAMPER_COMMAND: MemKey = MemKey::holding(14);
pub const COIL_SYSTEM_ENABLE: MemKey = MemKey::coil(10);
pub const COIL_DAMPENER_ENABLE: MemKey = MemKey::coil(11);

pub const MODE_OFF: u16 = 0;
pub const MODE_HEAT: u16 = 1;
pub const MODE_COOL: u16 = 2;
pub const MODE_AUTO: u16 = 3;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HvacParams {
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    pub min_humidity_pct: f64,
    pub max_humidity_pct: f64,
    pub outside_temp_c: f64,
    pub outside_humidity_pct: f64,
    /// Fan spin-up time constant, seconds.
    pub fan_tau_s: f64,
    /// Zone response time constant at full airflow, seconds.
    pub zone_tau_s: f64,
    pub stability_decay_rate: f64,
    pub stability_recovery_rate: f64,
}

impl Default for HvacParams {
    fn default() -> Self {
        Self {
            min_temperature_c: 18.0,
            max_temperature_c: 22.0,
            min_humidity_pct: 40.0,
            max_humidity_pct: 55.0,
            outside_temp_c: 10.0,
            outside_humidity_pct: 70.0,
            fan_tau_s: 5.0,
            zone_tau_s: 120.0,
            stability_decay_rate: 0.01,
            stability_recovery_rate: 0.005,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HvacState {
    pub zone_temp_c: f64,
    pub zone_humidity_pct: f64,
    pub supply_temp_c: f64,
    pub duct_pressure_pa: f64,
    pub fan_speed_pct: f64,
    pub damper_pct: f64,
    /// Dimensional stability, 1.0 = fully stable.
    pub stability: f64,
    pub energy_kw: f64,
}

impl Default for HvacState {
    fn default() -> Self {
        Self {
            zone_temp_c: 20.0,
            zone_humidity_pct: 45.0,
            supply_temp_c: 20.0,
            duct_pressure_pa: 0.0,
            fan_speed_pct: 0.0,
            damper_pct: 0.0,
            stability: 1.0,
            energy_kw: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HvacControls {
    temp_setpoint_c: f64,
    humidity_setpoint_pct: f64,
    fan_command_pct: f64,
    mode: u16,
    damper_command_pct: f64,
    enabled: bool,
    dampener_enabled: bool,
}

impl Default for HvacControls {
    fn default() -> Self {
        Self {
            temp_setpoint_c: 20.0,
            humidity_setpoint_pct: 45.0,
            fan_command_pct: 0.0,
            mode: MODE_OFF,
            damper_command_pct: 0.0,
            enabled: false,
            dampener_enabled: true,
        }
    }
}

pub struct HvacPhysics {
    device: String,
    params: HvacParams,
    state: HvacState,
    controls: HvacControls,
}

impl HvacPhysics {
    pub fn new(device: &str, params: HvacParams) -> Self {
        Self {
            device: device.to_string(),
            params,
            state: HvacState::default(),
            controls: HvacControls::default(),
        }
    }

    pub fn state(&self) -> &HvacState {
        &self.state
    }

    fn in_band(&self) -> (bool, bool) {
        let temp_ok = self.state.zone_temp_c >= self.params.min_temperature_c
            && self.state.zone_temp_c <= self.params.max_temperature_c;
        let rh_ok = self.state.zone_humidity_pct >= self.params.min_humidity_pct
            && self.state.zone_humidity_pct <= self.params.max_humidity_pct;
        (temp_ok, rh_ok)
    }

    fn system_off(&mut self, dt: f64) {
        self.state.fan_speed_pct *= 0.9_f64.powf(dt);
        if self.state.fan_speed_pct < 1.0 {
            self.state.fan_speed_pct = 0.0;
        }
        self.state.duct_pressure_pa *= 0.7_f64.powf(dt);
        self.state.damper_pct *= 0.9_f64.powf(dt);
        self.state.energy_kw *= 0.5_f64.powf(dt);
        if self.state.energy_kw < 0.1 {
            self.state.energy_kw = 0.0;
        }

        // Well-insulated zone drifts toward outside conditions very slowly
        let drift = 0.001 * dt;
        self.state.zone_temp_c +=
            (self.params.outside_temp_c - self.state.zone_temp_c) * drift;
        self.state.zone_humidity_pct +=
            (self.params.outside_humidity_pct - self.state.zone_humidity_pct) * drift;

        // Without active conditioning the index sags to a floor
        if self.state.stability > 0.5 {
            self.state.stability = (self.state.stability - 0.001 * dt).max(0.5);
        }
    }

    fn update_airflow(&mut self, dt: f64) {
        let fan_cmd = self.controls.fan_command_pct.clamp(0.0, 100.0);
        self.state.fan_speed_pct +=
            (fan_cmd - self.state.fan_speed_pct) * (dt / self.params.fan_tau_s);
        self.state.fan_speed_pct = self.state.fan_speed_pct.clamp(0.0, 100.0);

        // Fan laws: pressure rises with the square of speed
        let target_pa = 500.0 * (self.state.fan_speed_pct / 100.0).powi(2);
        self.state.duct_pressure_pa += (target_pa - self.state.duct_pressure_pa) * 0.5 * dt;

        let damper_cmd = self.controls.damper_command_pct.clamp(0.0, 100.0);
        self.state.damper_pct += (damper_cmd - self.state.damper_pct) * (dt / 30.0);
        self.state.damper_pct = self.state.damper_pct.clamp(0.0, 100.0);
    }

    fn update_zone(&mut self, dt: f64) {
        let setpoint = self.controls.temp_setpoint_c.clamp(5.0, 35.0);
        let heating_wanted = setpoint > self.state.zone_temp_c;
        let conditioning_active = match self.controls.mode {
            MODE_HEAT => heating_wanted,
            MODE_COOL => !heating_wanted,
            MODE_AUTO => true,
            _ => false,
        };

        // Authority scales with delivered airflow; the outside-air damper
        // bleeds in unconditioned air and fights the coils.
        let airflow = self.state.fan_speed_pct / 100.0;
        if conditioning_active && airflow > 0.01 {
            let gain = airflow * (dt / self.params.zone_tau_s);
            self.state.zone_temp_c += (setpoint - self.state.zone_temp_c) * gain;
            self.state.supply_temp_c = if heating_wanted {
                setpoint + 15.0
            } else {
                setpoint - 10.0
            };
        }
        let outside_gain =
            airflow * (self.state.damper_pct / 100.0) * (dt / self.params.zone_tau_s);
        self.state.zone_temp_c +=
            (self.params.outside_temp_c - self.state.zone_temp_c) * outside_gain;

        let rh_setpoint = self.controls.humidity_setpoint_pct.clamp(10.0, 90.0);
        if airflow > 0.01 {
            let gain = airflow * (dt / self.params.zone_tau_s);
            self.state.zone_humidity_pct +=
                (rh_setpoint - self.state.zone_humidity_pct) * gain;
            self.state.zone_humidity_pct += (self.params.outside_humidity_pct
                - self.state.zone_humidity_pct)
                * outside_gain;
        }
        self.state.zone_humidity_pct = self.state.zone_humidity_pct.clamp(0.0, 100.0);

        self.state.energy_kw =
            airflow * 5.0 + if conditioning_active { airflow * 40.0 } else { 0.0 };
    }

    fn update_stability(&mut self, dt: f64) {
        let (temp_ok, rh_ok) = self.in_band();
        if temp_ok && rh_ok {
            let rate = if self.controls.dampener_enabled {
                self.params.stability_recovery_rate
            } else {
                self.params.stability_recovery_rate * 0.2
            };
            self.state.stability = (self.state.stability + rate * dt).min(1.0);
            return;
        }

        let temp_excursion = if temp_ok {
            0.0
        } else {
            (self.state.zone_temp_c - self.params.max_temperature_c)
                .max(self.params.min_temperature_c - self.state.zone_temp_c)
                .max(0.0)
        };
        let rh_excursion = if rh_ok {
            0.0
        } else {
            (self.state.zone_humidity_pct - self.params.max_humidity_pct)
                .max(self.params.min_humidity_pct - self.state.zone_humidity_pct)
                .max(0.0)
        };
        let stress = temp_excursion / 5.0 + rh_excursion / 15.0;
        let dampener_factor = if self.controls.dampener_enabled { 1.0 } else { 3.0 };
        self.state.stability -=
            stress * self.params.stability_decay_rate * dampener_factor * dt;
        self.state.stability = self.state.stability.clamp(0.0, 1.0);

        if self.state.stability < 0.5 {
            warn!(
                device = %self.device,
                stability = self.state.stability,
                zone_temp = self.state.zone_temp_c,
                "Dimensional stability degrading"
            );
        }
    }
}

impl PhysicsEngine for HvacPhysics {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn read_controls(&mut self, fabric: &StateFabric) -> CoreResult<()> {
        let snapshot = fabric.read_bulk(&self.device)?;
        self.controls = HvacControls {
            temp_setpoint_c: snapshot.word(REG_TEMP_SETPOINT) as f64,
            humidity_setpoint_pct: snapshot.word(REG_HUMIDITY_SETPOINT) as f64,
            fan_command_pct: snapshot.word(REG_FAN_COMMAND) as f64,
            mode: snapshot.word(REG_MODE),
            damper_command_pct: snapshot.word(REG_DAMPER_COMMAND) as f64,
            enabled: snapshot.bit(COIL_SYSTEM_ENABLE),
            // Normally-on, as with the reactor stabilizer
            dampener_enabled: snapshot
                .get(COIL_DAMPENER_ENABLE)
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
        if !self.controls.enabled {
            self.system_off(dt);
        } else {
            self.update_airflow(dt);
            self.update_zone(dt);
        }
        self.update_stability(dt);
        debug!(
            device = %self.device,
            zone_temp = self.state.zone_temp_c,
            humidity = self.state.zone_humidity_pct,
            stability = self.state.stability,
            "HVAC updated"
        );
    }

    fn write_telemetry(&self, fabric: &StateFabric) -> CoreResult<()> {
        let s = &self.state;
        let (temp_ok, rh_ok) = self.in_band();
        let words = [
            word(s.zone_temp_c),
            word(s.zone_humidity_pct),
            word(s.supply_temp_c),
            word(s.duct_pressure_pa),
            word(s.stability * 100.0),
            word(s.fan_speed_pct),
            word(s.energy_kw),
        ];
        let status = [
            self.controls.enabled && s.fan_speed_pct > 1.0,
            !temp_ok,
            !rh_ok,
            s.stability < 0.5,
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridforge_core::{DeviceKind, SimClock};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn setup() -> (Arc<StateFabric>, HvacPhysics) {
        let fabric = StateFabric::new(SimClock::stepped());
        fabric
            .register(
                "library_hvac_1",
                DeviceKind::Plc,
                3,
                vec!["modbus".into()],
                HashMap::new(),
            )
            .unwrap();
        let hvac = HvacPhysics::new("library_hvac_1", HvacParams::default());
        hvac.write_telemetry(&fabric).unwrap();
        (fabric, hvac)
    }

    fn run(hvac: &mut HvacPhysics, fabric: &StateFabric, seconds: f64, dt: f64) {
        let steps = (seconds / dt).round() as usize;
        for _ in 0..steps {
            hvac.read_controls(fabric).unwrap();
            hvac.update(dt);
            hvac.write_telemetry(fabric).unwrap();
        }
    }

    #[test]
    fn test_holds_setpoint_in_auto() {
        let (fabric, mut hvac) = setup();
        fabric
            .write_bulk(
                "library_hvac_1",
                &[
                    (REG_TEMP_SETPOINT, MemValue::Word(20)),
                    (REG_HUMIDITY_SETPOINT, MemValue::Word(45)),
                    (REG_FAN_COMMAND, MemValue::Word(80)),
                    (REG_MODE, MemValue::Word(MODE_AUTO)),
                    (COIL_SYSTEM_ENABLE, MemValue::Bit(true)),
                    (COIL_DAMPENER_ENABLE, MemValue::Bit(true)),
                ],
            )
            .unwrap();
        run(&mut hvac, &fabric, 600.0, 0.5);
        assert!((hvac.state().zone_temp_c - 20.0).abs() < 1.0);
        assert!(hvac.state().stability > 0.95);
        let snap = fabric.read_bulk("library_hvac_1").unwrap();
        assert!(snap.bit(COIL_RUNNING));
        assert!(!snap.bit(COIL_TEMP_OUT_OF_BAND));
    }

    #[test]
    fn test_open_damper_drags_zone_cold() {
        let (fabric, mut hvac) = setup();
        // Fan on, conditioning off, damper wide open: outside air wins
        fabric
            .write_bulk(
                "library_hvac_1",
                &[
                    (REG_FAN_COMMAND, MemValue::Word(100)),
                    (REG_MODE, MemValue::Word(MODE_OFF)),
                    (REG_DAMPER_COMMAND, MemValue::Word(100)),
                    (COIL_SYSTEM_ENABLE, MemValue::Bit(true)),
                    (COIL_DAMPENER_ENABLE, MemValue::Bit(true)),
                ],
            )
            .unwrap();
        run(&mut hvac, &fabric, 900.0, 0.5);
        assert!(
            hvac.state().zone_temp_c < 18.0,
            "zone {}°C should fall below band with damper open",
            hvac.state().zone_temp_c
        );
        let snap = fabric.read_bulk("library_hvac_1").unwrap();
        assert!(snap.bit(COIL_TEMP_OUT_OF_BAND));
        assert!(hvac.state().stability < 1.0);
    }

    #[test]
    fn test_stability_rebuilds_in_band() {
        let (fabric, mut hvac) = setup();
        hvac.state.stability = 0.6;
        fabric
            .write_bulk(
                "library_hvac_1",
                &[
                    (REG_TEMP_SETPOINT, MemValue::Word(20)),
                    (REG_HUMIDITY_SETPOINT, MemValue::Word(45)),
                    (REG_FAN_COMMAND, MemValue::Word(60)),
                    (REG_MODE, MemValue::Word(MODE_AUTO)),
                    (COIL_SYSTEM_ENABLE, MemValue::Bit(true)),
                    (COIL_DAMPENER_ENABLE, MemValue::Bit(true)),
                ],
            )
            .unwrap();
        run(&mut hvac, &fabric, 300.0, 0.5);
        assert!(hvac.state().stability > 0.9);
    }

    #[test]
    fn test_off_system_drifts_and_floors_stability() {
        let (fabric, mut hvac) = setup();
        run(&mut hvac, &fabric, 2000.0, 1.0);
        assert!(hvac.state().fan_speed_pct == 0.0);
        assert!(hvac.state().zone_temp_c < 20.0);
        assert!(hvac.state().stability >= 0.5);
    }
}
