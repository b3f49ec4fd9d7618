//! # Steam Turbine — shaft dynamics, thermals, vibration, overspeed damage
//!
//! Control inputs (written by protocol clients or peer controllers):
//! - `holding_registers[10]` — speed setpoint, RPM
//! - `coils[10]` — governor enable
//! - `coils[11]` — emergency trip
//!
//! Telemetry (published every tick, mirrored into the read-only spaces):
//! - `holding_registers[0..=7]` — shaft RPM, steam T °C, steam P psi,
//!   bearing T °C, vibration ×10 mils, power MW, overspeed seconds,
//!   damage %
//! - status `coils[0..=4]` — running, overspeed, high vibration, high
//!   bearing temperature, severe damage

use crate::{word, PhysicsEngine};
use gridforge_core::{CoreResult, KernelEvent, MemKey, MemValue, StateFabric};
use tracing::{debug, warn};

// Telemetry addresses
pub const REG_SHAFT_SPEED: MemKey = MemKey::holding(0);
pub const REG_STEAM_TEMP: MemKey = MemKey::holding(1);
pub const REG_STEAM_PRESSURE: MemKey = MemKey::holding(2);
pub const REG_BEARING_TEMP: MemKey = MemKey::holding(3);
pub const REG_VIBRATION_X10: MemKey = MemKey::holding(4);
pub const REG_POWER_MW: MemKey = MemKey::holding(5);
pub const REG_OVERSPEED_SECS: MemKey = MemKey::holding(6);
pub const REG_DAMAGE_PCT: MemKey = MemKey::holding(7);

// Status coils
pub const COIL_RUNNING: MemKey = MemKey::coil(0);
pub const COIL_OVERSPEED: MemKey = MemKey::coil(1);
pub const COIL_HIGH_VIBRATION: MemKey = MemKey::coil(2);
pub const COIL_HIGH_BEARING_TEMP: MemKey = MemKey::coil(3);
pub const COIL_SEVERE_DAMAGE: MemKey = MemKey::coil(4);

// Controls
pub const REG_SPEED_SETPOINT: MemKey = MemKey::holding(10);
pub const COIL_GOVERNOR_ENABLE: MemKey = MemKey::coil(10);
pub const COIL_EMERGENCY_TRIP: MemKey = MemKey::coil(11);

const AMBIENT_C: f64 = 21.0;
const HIGH_BEARING_TEMP_C: f64 = 65.0;
const MIN_STABLE_SPEED_RATIO: f64 = 0.2;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TurbineParams {
    pub rated_speed_rpm: f64,
    pub rated_power_mw: f64,
    /// Overspeed trip point, typically 110% of rated.
    pub max_safe_speed_rpm: f64,
    pub accel_rpm_per_s: f64,
    pub decel_rpm_per_s: f64,
    /// First-order bearing thermal time constant, seconds.
    pub bearing_tau_s: f64,
    pub vibration_normal_mils: f64,
    pub vibration_critical_mils: f64,
}

impl Default for TurbineParams {
    fn default() -> Self {
        Self {
            rated_speed_rpm: 3600.0,
            rated_power_mw: 100.0,
            max_safe_speed_rpm: 3960.0,
            accel_rpm_per_s: 100.0,
            decel_rpm_per_s: 50.0,
            bearing_tau_s: 10.0,
            vibration_normal_mils: 2.0,
            vibration_critical_mils: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TurbineState {
    pub shaft_speed_rpm: f64,
    pub steam_temp_c: f64,
    pub steam_pressure_psi: f64,
    pub bearing_temp_c: f64,
    pub vibration_mils: f64,
    pub power_mw: f64,
    pub overspeed_accumulated_s: f64,
    /// Accumulated overspeed damage, 0.0–1.0.
    pub damage: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TurbineControls {
    setpoint_rpm: f64,
    governor_enabled: bool,
    emergency_trip: bool,
}

pub struct TurbinePhysics {
    device: String,
    params: TurbineParams,
    state: TurbineState,
    controls: TurbineControls,
    overspeed_latched: bool,
    events: Vec<KernelEvent>,
}

impl TurbinePhysics {
    pub fn new(device: &str, params: TurbineParams) -> Self {
        let mut state = TurbineState::default();
        state.bearing_temp_c = AMBIENT_C;
        state.steam_temp_c = AMBIENT_C;
        Self {
            device: device.to_string(),
            params,
            state,
            controls: TurbineControls::default(),
            overspeed_latched: false,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> &TurbineState {
        &self.state
    }

    pub fn params(&self) -> &TurbineParams {
        &self.params
    }

    /// Pre-spin to a given speed. Test and scenario setup only.
    pub fn set_shaft_speed(&mut self, rpm: f64) {
        self.state.shaft_speed_rpm = rpm.max(0.0);
    }

    fn governor_update(&mut self, dt: f64) {
        let setpoint = self.controls.setpoint_rpm.max(0.0);
        let error = setpoint - self.state.shaft_speed_rpm;
        if error.abs() < 1.0 {
            self.state.shaft_speed_rpm = setpoint;
            return;
        }
        if error > 0.0 {
            let accel = self.params.accel_rpm_per_s.min(error.abs() * 10.0);
            self.state.shaft_speed_rpm += accel * dt;
        } else {
            let decel = self.params.decel_rpm_per_s.min(error.abs() * 10.0);
            self.state.shaft_speed_rpm -= decel * dt;
        }
        self.state.shaft_speed_rpm = self.state.shaft_speed_rpm.max(0.0);
    }

    fn coast(&mut self, dt: f64, rate: f64) {
        if self.state.shaft_speed_rpm > 0.0 {
            self.state.shaft_speed_rpm =
                (self.state.shaft_speed_rpm - rate * dt).max(0.0);
        }
    }

    fn update_thermals(&mut self, dt: f64) {
        let speed_ratio = self.state.shaft_speed_rpm / self.params.rated_speed_rpm;
        let vib_ratio = self.state.vibration_mils / self.params.vibration_normal_mils;

        let bearing_target = AMBIENT_C + speed_ratio * 58.0 + vib_ratio * 15.0;
        self.state.bearing_temp_c += (bearing_target - self.state.bearing_temp_c)
            * (dt / self.params.bearing_tau_s);

        let (steam_t_target, steam_p_target) = if self.state.shaft_speed_rpm > 100.0 {
            (315.0 + speed_ratio * 167.0, 1000.0 + speed_ratio * 800.0)
        } else {
            (AMBIENT_C, 0.0)
        };
        self.state.steam_temp_c +=
            (steam_t_target - self.state.steam_temp_c) * 0.05 * dt;
        self.state.steam_pressure_psi +=
            (steam_p_target - self.state.steam_pressure_psi) * 0.1 * dt;
    }

    fn update_vibration(&mut self) {
        let deviation = (self.state.shaft_speed_rpm - self.params.rated_speed_rpm)
            .abs()
            / self.params.rated_speed_rpm;
        self.state.vibration_mils =
            self.params.vibration_normal_mils * (1.0 + deviation * 3.0);
        self.state.vibration_mils *= 1.0 + self.state.damage;
    }

    fn update_power(&mut self) {
        let ratio = self.state.shaft_speed_rpm / self.params.rated_speed_rpm;
        self.state.power_mw = if ratio < MIN_STABLE_SPEED_RATIO || self.state.damage > 0.5 {
            0.0
        } else if ratio <= 1.0 {
            self.params.rated_power_mw * ratio
        } else {
            self.params.rated_power_mw * ratio.min(1.05)
        };
    }

    fn update_damage(&mut self, dt: f64) {
        if self.state.shaft_speed_rpm <= self.params.rated_speed_rpm {
            return;
        }
        self.state.overspeed_accumulated_s += dt;
        let ratio = self.state.shaft_speed_rpm / self.params.rated_speed_rpm;
        if ratio > 1.1 {
            // 1%/s of damage at 120% rated, scaling linearly with overshoot
            let rate = (ratio - 1.1) * 0.1;
            let before = self.state.damage;
            self.state.damage = (self.state.damage + rate * dt).min(1.0);
            if before <= 0.5 && self.state.damage > 0.5 {
                warn!(
                    device = %self.device,
                    rpm = self.state.shaft_speed_rpm,
                    "Turbine damage past 50% — catastrophic failure"
                );
            }
        }
    }
}

impl PhysicsEngine for TurbinePhysics {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn read_controls(&mut self, fabric: &StateFabric) -> CoreResult<()> {
        let snapshot = fabric.read_bulk(&self.device)?;
        self.controls = TurbineControls {
            setpoint_rpm: snapshot.word(REG_SPEED_SETPOINT) as f64,
            governor_enabled: snapshot.bit(COIL_GOVERNOR_ENABLE),
            emergency_trip: snapshot.bit(COIL_EMERGENCY_TRIP),
        };
        Ok(())
    }

    fn update(&mut self, dt: f64) {
        if dt <= 0.0 {
            warn!(device = %self.device, dt, "Invalid time delta, skipping update");
            return;
        }

        if self.state.damage > 0.5 {
            // Catastrophic failure: the machine is wrecking itself; nothing
            // the governor does matters any more.
            self.coast(dt, self.params.decel_rpm_per_s * 2.0);
        } else if self.controls.emergency_trip {
            self.coast(dt, self.params.decel_rpm_per_s * 2.0);
            let cool = (AMBIENT_C - self.state.bearing_temp_c) * 0.1 * dt;
            self.state.bearing_temp_c += cool;
            self.state.steam_temp_c += (AMBIENT_C - self.state.steam_temp_c) * 0.05 * dt;
        } else if self.controls.governor_enabled {
            self.governor_update(dt);
        } else {
            self.coast(dt, self.params.decel_rpm_per_s);
        }

        self.update_thermals(dt);
        self.update_vibration();
        self.update_damage(dt);
        self.update_power();

        let overspeed = self.state.shaft_speed_rpm > self.params.max_safe_speed_rpm;
        if overspeed && !self.overspeed_latched {
            self.overspeed_latched = true;
            self.events.push(KernelEvent::OverspeedTrip {
                device: self.device.clone(),
                speed_rpm: self.state.shaft_speed_rpm,
                trip_rpm: self.params.max_safe_speed_rpm,
            });
        } else if !overspeed {
            self.overspeed_latched = false;
        }

        debug!(
            device = %self.device,
            rpm = self.state.shaft_speed_rpm,
            power_mw = self.state.power_mw,
            damage = self.state.damage,
            "Turbine updated"
        );
    }

    fn write_telemetry(&self, fabric: &StateFabric) -> CoreResult<()> {
        let s = &self.state;
        let p = &self.params;
        let running = s.shaft_speed_rpm > 100.0 && s.damage <= 0.5;
        let status = [
            running,
            s.shaft_speed_rpm > p.max_safe_speed_rpm,
            s.vibration_mils > p.vibration_critical_mils,
            s.bearing_temp_c > HIGH_BEARING_TEMP_C,
            s.damage > 0.5,
        ];
        let words = [
            word(s.shaft_speed_rpm),
            word(s.steam_temp_c),
            word(s.steam_pressure_psi),
            word(s.bearing_temp_c),
            word(s.vibration_mils * 10.0),
            word(s.power_mw),
            word(s.overspeed_accumulated_s),
            word(s.damage * 100.0),
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
