//! # Demo Plant — the UU Power & Light reference site
//!
//! Three 33 MW steam turbines with an independent safety controller on
//! unit 1, one reactor, the archive-hall HVAC, a SCADA master with HMI
//! and historian, a grid monitor, and a substation RTU running the power
//! flow — spread across plant, supervisory, and corporate segments with
//! one dual-homed engineering workstation.
//!
//! Ports default to the unprivileged 10000-offset convention (Modbus
//! 10502+); pass `port_base = 0` to bind everything ephemeral for tests.

use crate::orchestrator::PlantParts;
use gridforge_core::config::{
    AllowRuleSpec, BusSpec, DeviceSpec, GeneratorSpec, GridSpec, LineSpec, ListenerSpec,
    NetworkSpec, PlantConfig, SimulationConfig, TopologySpec,
};
use gridforge_core::{ClockMode, DeviceKind, MemKey};
use gridforge_devices::historian::HistorianLogic;
use gridforge_devices::hmi::HmiLogic;
use gridforge_devices::plc::{PlcLogic, ProcessKind};
use gridforge_devices::safety::{TurbineSafetyLogic, TurbineSafetyParams};
use gridforge_devices::scada::{ScadaLogic, TagDefinition};
use gridforge_devices::DeviceLogic;
use gridforge_physics::grid::GridPhysics;
use gridforge_physics::hvac::{HvacParams, HvacPhysics};
use gridforge_physics::power_flow::PowerFlowSolver;
use gridforge_physics::reactor::{ReactorParams, ReactorPhysics};
use gridforge_physics::turbine::{TurbineParams, TurbinePhysics};
use gridforge_physics::PhysicsEngine;
use std::collections::{BTreeMap, HashMap};

pub const TURBINES: [&str; 3] = ["turbine_plc_1", "turbine_plc_2", "turbine_plc_3"];

fn port(base: u16, offset: u16) -> u16 {
    if base == 0 {
        0
    } else {
        base + offset
    }
}

fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn turbine_params() -> TurbineParams {
    TurbineParams {
        rated_power_mw: 33.0,
        ..Default::default()
    }
}

/// The full demo site. `host` is the bind address for every listener;
/// `port_base` of 10000 yields Modbus on 10502+, 0 means ephemeral.
pub fn demo_plant(host: &str, port_base: u16) -> (PlantConfig, PlantParts) {
    let mut devices = Vec::new();

    // Field controllers
    for (i, name) in TURBINES.iter().enumerate() {
        devices.push(DeviceSpec {
            name: name.to_string(),
            kind: DeviceKind::Plc,
            device_id: (i + 1) as u16,
            scan_interval: 0.1,
            listeners: vec![ListenerSpec::modbus(
                host,
                port(port_base, 502 + i as u16),
                (i + 1) as u8,
            )],
            metadata: meta(&[
                ("vendor", "UU Power & Light"),
                ("product", "HEX-TRB-3600"),
                ("revision", "3.1"),
                ("process", "steam_turbine"),
            ]),
        });
    }
    devices.push(DeviceSpec {
        name: "turbine_sis_1".into(),
        kind: DeviceKind::Sis,
        device_id: 11,
        scan_interval: 0.05,
        listeners: vec![ListenerSpec::modbus(host, port(port_base, 510), 11)],
        metadata: meta(&[
            ("vendor", "UU Power & Light"),
            ("product", "HEX-SIS-2"),
            ("revision", "1.4"),
        ]),
    });
    devices.push(DeviceSpec {
        name: "reactor_plc_1".into(),
        kind: DeviceKind::Plc,
        device_id: 4,
        scan_interval: 0.1,
        listeners: vec![
            ListenerSpec::modbus(host, port(port_base, 505), 4),
            ListenerSpec {
                protocol: "s7".into(),
                host: host.into(),
                port: port(port_base, 102),
                unit_id: 0,
            },
        ],
        metadata: meta(&[
            ("vendor", "UU Power & Light"),
            ("product", "BURSAR-S7-400"),
            ("revision", "2003.9"),
            ("process", "alchemical_reactor"),
        ]),
    });
    devices.push(DeviceSpec {
        name: "library_hvac_1".into(),
        kind: DeviceKind::Plc,
        device_id: 5,
        scan_interval: 0.5,
        listeners: vec![ListenerSpec::modbus(host, port(port_base, 506), 5)],
        metadata: meta(&[
            ("vendor", "UU Power & Light"),
            ("product", "LIB-ENV-87"),
            ("revision", "1987.2"),
            ("process", "hvac"),
        ]),
    });

    // Supervisory layer
    devices.push(DeviceSpec {
        name: "scada_master_1".into(),
        kind: DeviceKind::Scada,
        device_id: 20,
        scan_interval: 0.1,
        listeners: vec![ListenerSpec::modbus(host, port(port_base, 520), 20)],
        metadata: meta(&[("vendor", "UU Power & Light"), ("product", "HEXVIEW-SCADA")]),
    });
    devices.push(DeviceSpec {
        name: "hmi_operator_1".into(),
        kind: DeviceKind::Hmi,
        device_id: 21,
        scan_interval: 0.05,
        listeners: vec![],
        metadata: HashMap::new(),
    });
    devices.push(DeviceSpec {
        name: "historian_primary".into(),
        kind: DeviceKind::Historian,
        device_id: 22,
        scan_interval: 5.0,
        listeners: vec![ListenerSpec {
            protocol: "opcua".into(),
            host: host.into(),
            port: port(port_base, 4840),
            unit_id: 0,
        }],
        metadata: HashMap::new(),
    });

    // Grid layer
    devices.push(DeviceSpec {
        name: "grid_monitor_1".into(),
        kind: DeviceKind::Rtu,
        device_id: 50,
        scan_interval: 0.2,
        listeners: vec![
            ListenerSpec::modbus(host, port(port_base, 530), 50),
            ListenerSpec {
                protocol: "iec104".into(),
                host: host.into(),
                port: port(port_base, 2404),
                unit_id: 0,
            },
        ],
        metadata: meta(&[("vendor", "UU Power & Light"), ("product", "GRID-FREQ-50")]),
    });
    devices.push(DeviceSpec {
        name: "substation_rtu_1".into(),
        kind: DeviceKind::Rtu,
        device_id: 60,
        scan_interval: 0.2,
        listeners: vec![
            ListenerSpec {
                protocol: "dnp3".into(),
                host: host.into(),
                port: port(port_base, 10000),
                unit_id: 10,
            },
            ListenerSpec {
                protocol: "enip".into(),
                host: host.into(),
                port: port(port_base, 34818),
                unit_id: 0,
            },
        ],
        metadata: meta(&[("product", "SUB-RTU-9")]),
    });

    // Dual-homed pivot host
    devices.push(DeviceSpec {
        name: "engineering_ws_1".into(),
        kind: DeviceKind::Hmi,
        device_id: 30,
        scan_interval: 1.0,
        listeners: vec![],
        metadata: meta(&[("os", "ankh-nt-4")]),
    });

    let topology = TopologySpec {
        networks: vec![
            NetworkSpec {
                name: "plant_network".into(),
                // Loopback-mapped so local tooling lands on the plant
                // segment out of the box
                subnet: "127.0.0.0/8".into(),
                vlan: 100,
            },
            NetworkSpec {
                name: "scada_network".into(),
                subnet: "10.10.0.0/16".into(),
                vlan: 200,
            },
            NetworkSpec {
                name: "corporate_network".into(),
                subnet: "10.0.0.0/8".into(),
                vlan: 1,
            },
        ],
        memberships: BTreeMap::from([
            (
                "plant_network".to_string(),
                vec![
                    "turbine_plc_1".into(),
                    "turbine_plc_2".into(),
                    "turbine_plc_3".into(),
                    "turbine_sis_1".into(),
                    "reactor_plc_1".into(),
                    "library_hvac_1".into(),
                    "grid_monitor_1".into(),
                    "substation_rtu_1".into(),
                ],
            ),
            (
                "scada_network".to_string(),
                vec![
                    "scada_master_1".into(),
                    "hmi_operator_1".into(),
                    "historian_primary".into(),
                    "engineering_ws_1".into(),
                ],
            ),
            (
                "corporate_network".to_string(),
                vec!["engineering_ws_1".into()],
            ),
        ]),
        allow_rules: vec![AllowRuleSpec {
            src_network: "scada_network".into(),
            device: "turbine_plc_1".into(),
            protocol: "modbus".into(),
            port: port(port_base, 502),
        }],
        fallback_network: "corporate_network".into(),
    };

    let grid = GridSpec {
        nominal_frequency_hz: 50.0,
        inertia_mws: 5000.0,
        damping_mw_per_hz: 1.0,
        min_frequency_hz: 49.0,
        max_frequency_hz: 51.0,
        base_load_mw: 100.0,
        base_mva: 100.0,
        buses: vec![
            BusSpec { name: "bus_plant".into(), load_mw: 0.0 },
            BusSpec { name: "bus_city".into(), load_mw: 100.0 },
        ],
        lines: vec![LineSpec {
            name: "line_plant_city".into(),
            from_bus: "bus_plant".into(),
            to_bus: "bus_city".into(),
            reactance_pu: 0.08,
            rating_mva: 120.0,
        }],
        generators: TURBINES
            .iter()
            .map(|t| GeneratorSpec {
                device: t.to_string(),
                bus: "bus_plant".into(),
            })
            .collect(),
    };

    // ── Physics engines ─────────────────────────────────────────────────
    let mut engines: Vec<Box<dyn PhysicsEngine>> = Vec::new();
    for name in TURBINES {
        engines.push(Box::new(TurbinePhysics::new(name, turbine_params())));
    }
    engines.push(Box::new(ReactorPhysics::new(
        "reactor_plc_1",
        ReactorParams::default(),
    )));
    engines.push(Box::new(HvacPhysics::new(
        "library_hvac_1",
        HvacParams::default(),
    )));
    engines.push(Box::new(GridPhysics::new(
        "grid_monitor_1",
        &grid,
        TURBINES.iter().map(|t| t.to_string()).collect(),
    )));
    engines.push(Box::new(
        PowerFlowSolver::new("substation_rtu_1", &grid)
            .expect("demo grid spec is well formed"),
    ));

    // ── Device logic ────────────────────────────────────────────────────
    let mut scada = ScadaLogic::new("scada_master_1");
    for (i, name) in TURBINES.iter().enumerate() {
        scada.add_tag(TagDefinition {
            tag_name: format!("TURB{}_SPEED", i + 1),
            device: name.to_string(),
            address: MemKey::holding(0),
            poll_period: 0.5,
            alarm_high: Some(3960.0),
            alarm_low: None,
            hysteresis: 60.0,
            unit: "rpm".into(),
        });
        scada.add_tag(TagDefinition {
            tag_name: format!("TURB{}_POWER", i + 1),
            device: name.to_string(),
            address: MemKey::holding(5),
            poll_period: 1.0,
            alarm_high: None,
            alarm_low: None,
            hysteresis: 0.0,
            unit: "MW".into(),
        });
    }
    scada.add_tag(TagDefinition {
        tag_name: "REACT1_CORE_TEMP".into(),
        device: "reactor_plc_1".into(),
        address: MemKey::holding(0),
        poll_period: 0.5,
        alarm_high: Some(400.0),
        alarm_low: None,
        hysteresis: 10.0,
        unit: "degC".into(),
    });
    scada.add_tag(TagDefinition {
        tag_name: "GRID_FREQ_X100".into(),
        device: "grid_monitor_1".into(),
        address: MemKey::holding(0),
        poll_period: 0.5,
        alarm_high: Some(5100.0),
        alarm_low: Some(4900.0),
        hysteresis: 10.0,
        unit: "cHz".into(),
    });
    let tag_db = scada.tag_db();

    let mut hmi = HmiLogic::new("hmi_operator_1", "scada_master_1", tag_db.clone());
    hmi.add_screen(
        "turbine_overview",
        vec![
            "TURB1_SPEED".into(),
            "TURB1_POWER".into(),
            "TURB2_SPEED".into(),
            "TURB3_SPEED".into(),
        ],
    );
    hmi.add_screen(
        "plant_overview",
        vec!["REACT1_CORE_TEMP".into(), "GRID_FREQ_X100".into()],
    );

    let mut historian = HistorianLogic::new("historian_primary", tag_db, 100_000);
    for tag in ["TURB1_SPEED", "TURB1_POWER", "REACT1_CORE_TEMP", "GRID_FREQ_X100"] {
        historian.record_tag(tag);
    }

    let mut scanners: Vec<DeviceLogic> = Vec::new();
    for name in TURBINES {
        scanners.push(DeviceLogic::Plc(PlcLogic::new(
            name,
            ProcessKind::Turbine,
            3600.0,
        )));
    }
    scanners.push(DeviceLogic::Safety(TurbineSafetyLogic::new(
        "turbine_sis_1",
        "turbine_plc_1",
        TurbineSafetyParams::default(),
    )));
    scanners.push(DeviceLogic::Plc(PlcLogic::new(
        "reactor_plc_1",
        ProcessKind::Reactor,
        0.0,
    )));
    scanners.push(DeviceLogic::Plc(PlcLogic::new(
        "library_hvac_1",
        ProcessKind::Hvac,
        0.0,
    )));
    scanners.push(DeviceLogic::Scada(scada));
    scanners.push(DeviceLogic::Hmi(hmi));
    scanners.push(DeviceLogic::Historian(historian));

    let config = PlantConfig {
        simulation: SimulationConfig::default(),
        devices,
        topology,
        grid: Some(grid),
    };
    let parts = PlantParts {
        engines,
        scanners,
        grid_tied_generators: TURBINES.iter().map(|t| t.to_string()).collect(),
    };
    (config, parts)
}

/// Demo plant in stepped mode, every listener ephemeral. The fixture the
/// scenario tests boot.
pub fn demo_plant_stepped() -> (PlantConfig, PlantParts) {
    let (mut config, parts) = demo_plant("127.0.0.1", 0);
    config.simulation.clock_mode = ClockMode::Stepped;
    (config, parts)
}
