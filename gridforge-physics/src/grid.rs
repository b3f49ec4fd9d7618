//! # Grid Frequency — swing-equation dynamics and protection
//!
//! One engine per electrical island. Generation is aggregated from the
//! power telemetry (`holding_registers[5]`) of the bound generator
//! devices; load comes from configuration, overridable at runtime through
//! `holding_registers[10]` on the monitor device. Frequency integrates
//!
//! `df/dt = (P_gen − P_load − D·(f − f_nom)) / (2H)`
//!
//! Crossing a protection limit latches a trip and raises `GridTrip`
//! exactly once; the orchestrator fans the trip out to tied generators.

use crate::{word, PhysicsEngine};
use gridforge_core::config::GridSpec;
use gridforge_core::{CoreResult, KernelEvent, MemKey, MemValue, StateFabric};
use tracing::{debug, error, warn};

pub const REG_FREQUENCY_X100: MemKey = MemKey::holding(0);
pub const REG_GENERATION_MW: MemKey = MemKey::holding(1);
pub const REG_LOAD_MW: MemKey = MemKey::holding(2);

pub const COIL_UNDER_FREQUENCY_TRIP: MemKey = MemKey::coil(0);
pub const COIL_OVER_FREQUENCY_TRIP: MemKey = MemKey::coil(1);

/// Runtime load override, MW. Zero means "use the configured base load".
pub const REG_LOAD_OVERRIDE: MemKey = MemKey::holding(10);

/// Power telemetry register read from each generator device.
const GENERATOR_POWER_REG: MemKey = MemKey::holding(5);

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GridState {
    pub frequency_hz: f64,
    pub total_gen_mw: f64,
    pub total_load_mw: f64,
    pub under_frequency_trip: bool,
    pub over_frequency_trip: bool,
}

pub struct GridPhysics {
    device: String,
    generators: Vec<String>,
    nominal_hz: f64,
    inertia_mws: f64,
    damping_mw_per_hz: f64,
    min_hz: f64,
    max_hz: f64,
    base_load_mw: f64,
    state: GridState,
    trip_latched: bool,
    events: Vec<KernelEvent>,
}

impl GridPhysics {
    pub fn new(device: &str, spec: &GridSpec, generators: Vec<String>) -> Self {
        let state = GridState {
            frequency_hz: spec.nominal_frequency_hz,
            ..Default::default()
        };
        Self {
            device: device.to_string(),
            generators,
            nominal_hz: spec.nominal_frequency_hz,
            inertia_mws: spec.inertia_mws,
            damping_mw_per_hz: spec.damping_mw_per_hz,
            min_hz: spec.min_frequency_hz,
            max_hz: spec.max_frequency_hz,
            base_load_mw: spec.base_load_mw,
            state,
            trip_latched: false,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> &GridState {
        &self.state
    }

    pub fn is_trip_latched(&self) -> bool {
        self.trip_latched
    }

    /// Clear the protection latch once frequency is back inside limits.
    pub fn reset_trip(&mut self) -> bool {
        if self.state.frequency_hz > self.min_hz && self.state.frequency_hz < self.max_hz {
            self.trip_latched = false;
            self.state.under_frequency_trip = false;
            self.state.over_frequency_trip = false;
            true
        } else {
            warn!(
                device = %self.device,
                frequency = self.state.frequency_hz,
                "Trip reset refused, frequency outside limits"
            );
            false
        }
    }
}

impl PhysicsEngine for GridPhysics {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn read_controls(&mut self, fabric: &StateFabric) -> CoreResult<()> {
        let mut total = 0.0;
        for generator in &self.generators {
            if let Ok(Some(MemValue::Word(mw))) = fabric.read(generator, GENERATOR_POWER_REG)
            {
                total += mw as f64;
            }
        }
        self.state.total_gen_mw = total;

        let override_mw = fabric
            .read(&self.device, REG_LOAD_OVERRIDE)?
            .and_then(|v| v.as_word())
            .unwrap_or(0);
        self.state.total_load_mw = if override_mw > 0 {
            override_mw as f64
        } else {
            self.base_load_mw
        };
        Ok(())
    }

    fn update(&mut self, dt: f64) {
        if dt <= 0.0 {
            warn!(device = %self.device, dt, "Invalid time delta, skipping update");
            return;
        }
        let imbalance = self.state.total_gen_mw - self.state.total_load_mw;
        let damping =
            self.damping_mw_per_hz * (self.state.frequency_hz - self.nominal_hz);
        let df_dt = (imbalance - damping) / (2.0 * self.inertia_mws);
        self.state.frequency_hz += df_dt * dt;

        let under = self.state.frequency_hz < self.min_hz;
        let over = self.state.frequency_hz > self.max_hz;
        if (under || over) && !self.trip_latched {
            self.trip_latched = true;
            self.state.under_frequency_trip = under;
            self.state.over_frequency_trip = over;
            let limit = if under { self.min_hz } else { self.max_hz };
            error!(
                device = %self.device,
                frequency = self.state.frequency_hz,
                limit,
                "Grid protection trip"
            );
            self.events.push(KernelEvent::GridTrip {
                frequency_hz: self.state.frequency_hz,
                limit_hz: limit,
                under_frequency: under,
            });
        }

        debug!(
            device = %self.device,
            frequency = self.state.frequency_hz,
            gen_mw = self.state.total_gen_mw,
            load_mw = self.state.total_load_mw,
            "Grid updated"
        );
    }

    fn write_telemetry(&self, fabric: &StateFabric) -> CoreResult<()> {
        let s = &self.state;
        let words = [
            word(s.frequency_hz * 100.0),
            word(s.total_gen_mw),
            word(s.total_load_mw),
        ];
        let status = [s.under_frequency_trip, s.over_frequency_trip];
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
