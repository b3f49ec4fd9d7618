//! # Configuration Catalogue — declarative simulation description
//!
//! Plain data types describing a plant: devices, listeners, networks,
//! memberships, and grid topology. The kernel never reads files; an
//! external loader (or test/demo code) populates these and hands them to
//! the orchestrator.

use crate::clock::ClockMode;
use crate::fabric::DeviceKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Clock and tick-loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub clock_mode: ClockMode,
    pub speed: f64,
    /// Wall interval of the clock advance task and the tick loop, seconds.
    pub update_interval: f64,
    /// Consecutive scan failures before a device is marked faulted.
    pub fault_threshold: u32,
    /// Wall milliseconds granted to sessions on shutdown before abort.
    pub drain_window_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            clock_mode: ClockMode::RealTime,
            speed: 1.0,
            update_interval: crate::DEFAULT_UPDATE_INTERVAL,
            fault_threshold: crate::DEFAULT_FAULT_THRESHOLD,
            drain_window_ms: 500,
        }
    }
}

/// One protocol endpoint exposed by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Modbus unit identifier (ignored by other protocols).
    pub unit_id: u8,
}

impl ListenerSpec {
    pub fn modbus(host: &str, port: u16, unit_id: u8) -> Self {
        Self {
            protocol: "modbus".into(),
            host: host.into(),
            port,
            unit_id,
        }
    }
}

/// One device in the catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub device_id: u16,
    /// Scan interval in simulation seconds.
    pub scan_interval: f64,
    pub listeners: Vec<ListenerSpec>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DeviceSpec {
    pub fn protocols(&self) -> Vec<String> {
        let mut protos: Vec<String> =
            self.listeners.iter().map(|l| l.protocol.clone()).collect();
        protos.sort();
        protos.dedup();
        protos
    }
}

/// A named network segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// IPv4 CIDR, e.g. `192.168.1.0/24`.
    pub subnet: String,
    pub vlan: u16,
}

/// Explicit cross-network allow rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRuleSpec {
    pub src_network: String,
    pub device: String,
    pub protocol: String,
    pub port: u16,
}

/// Networks, device memberships, and cross-network rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySpec {
    pub networks: Vec<NetworkSpec>,
    /// network name → member device names
    pub memberships: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub allow_rules: Vec<AllowRuleSpec>,
    /// Network assumed for peers whose address matches no subnet.
    pub fallback_network: String,
}

/// A grid bus with its fixed load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSpec {
    pub name: String,
    #[serde(default)]
    pub load_mw: f64,
}

/// A transmission line between two buses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSpec {
    pub name: String,
    pub from_bus: String,
    pub to_bus: String,
    pub reactance_pu: f64,
    pub rating_mva: f64,
}

/// Binds a generating device's power telemetry to a bus injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSpec {
    pub device: String,
    pub bus: String,
}

/// Grid frequency dynamics and electrical network description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSpec {
    pub nominal_frequency_hz: f64,
    /// System inertia, MW·s.
    pub inertia_mws: f64,
    /// Load damping, MW/Hz.
    pub damping_mw_per_hz: f64,
    pub min_frequency_hz: f64,
    pub max_frequency_hz: f64,
    /// Aggregate system load, MW.
    pub base_load_mw: f64,
    pub base_mva: f64,
    #[serde(default)]
    pub buses: Vec<BusSpec>,
    #[serde(default)]
    pub lines: Vec<LineSpec>,
    #[serde(default)]
    pub generators: Vec<GeneratorSpec>,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            nominal_frequency_hz: 50.0,
            inertia_mws: 5000.0,
            damping_mw_per_hz: 1.0,
            min_frequency_hz: 49.0,
            max_frequency_hz: 51.0,
            base_load_mw: 80.0,
            base_mva: 100.0,
            buses: Vec::new(),
            lines: Vec::new(),
            generators: Vec::new(),
        }
    }
}

/// The complete plant description handed to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlantConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    pub devices: Vec<DeviceSpec>,
    pub topology: TopologySpec,
    #[serde(default)]
    pub grid: Option<GridSpec>,
}
