//! # Orchestrator — boot, tick, sync, shutdown
//!
//! Boot follows a strict order; any failure aborts with a diagnostic.
//! Each tick runs physics → due scans → protocol sync, with every
//! collection iterated in sorted device order so stepped-mode runs are
//! reproducible byte for byte. Listener sessions run concurrently on the
//! runtime and only touch their mirrors; the sync step is the single
//! bridge between mirrors and the fabric.

use gridforge_core::config::PlantConfig;
use gridforge_core::{
    CoreError, CoreResult, EventLog, KernelEvent, MemValue, SimClock, StateFabric,
};
use gridforge_devices::{DeviceLogic, DeviceScanner, ScanContext};
use gridforge_network::{ConnectionLog, NetworkGate, Topology};
use gridforge_physics::PhysicsEngine;
use gridforge_protocols::modbus::{DeviceIdentity, ModbusTcpListener};
use gridforge_protocols::{
    dnp3::dnp3_listener, enip::enip_listener, iec104::iec104_listener,
    opcua::opcua_listener, s7::s7_listener, MirrorSizes, ProtocolServer,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything the catalogue assembles besides the declarative config:
/// physics engines, device logic, and the generators a grid trip fans
/// out to.
pub struct PlantParts {
    pub engines: Vec<Box<dyn PhysicsEngine>>,
    /// Scan intervals come from each device's catalogue entry.
    pub scanners: Vec<DeviceLogic>,
    /// Devices whose trip coil is asserted when the grid protection fires.
    pub grid_tied_generators: Vec<String>,
}

pub struct Orchestrator {
    clock: Arc<SimClock>,
    fabric: Arc<StateFabric>,
    events: Arc<EventLog>,
    gate: Arc<NetworkGate>,
    engines: Vec<Box<dyn PhysicsEngine>>,
    scanners: Vec<DeviceScanner>,
    listeners: Vec<Box<dyn ProtocolServer>>,
    grid_tied_generators: Vec<String>,
    faulted_engines: HashSet<String>,
    last_tick_time: f64,
    started: bool,
}

impl Orchestrator {
    /// Boot the plant. Steps, in order: clock → fabric → device registry →
    /// physics engines → scan machines → topology/gate → listeners.
    /// Listener bind failures are logged and skipped; everything else is
    /// fatal.
    pub async fn boot(config: PlantConfig, parts: PlantParts) -> CoreResult<Self> {
        // 1. Clock
        let sim = &config.simulation;
        let clock = SimClock::new(sim.clock_mode, sim.speed, sim.update_interval);

        // 2. State fabric
        let fabric = StateFabric::new(Arc::clone(&clock));
        let events = EventLog::new(Arc::clone(&clock));

        // 3. Devices
        for spec in &config.devices {
            fabric.register(
                &spec.name,
                spec.kind,
                spec.device_id,
                spec.protocols(),
                spec.metadata.clone(),
            )?;
            fabric.set_online(&spec.name, true)?;
            events.publish(KernelEvent::DeviceRegistered {
                device: spec.name.clone(),
            });
        }

        // 4. Physics engines, stable order, initial telemetry
        let mut engines = parts.engines;
        engines.sort_by(|a, b| a.device_name().cmp(b.device_name()));
        for engine in &engines {
            if !fabric.contains(engine.device_name()) {
                return Err(CoreError::InvalidConfig(format!(
                    "physics engine bound to unregistered device '{}'",
                    engine.device_name()
                )));
            }
            engine.write_telemetry(&fabric)?;
        }

        // 5. Scan machines, stable order, intervals from the catalogue
        let mut scanners: Vec<DeviceScanner> = Vec::with_capacity(parts.scanners.len());
        for logic in parts.scanners {
            let interval = config
                .devices
                .iter()
                .find(|d| d.name == logic.device_name())
                .map(|d| d.scan_interval)
                .ok_or_else(|| {
                    CoreError::InvalidConfig(format!(
                        "scan machine bound to unregistered device '{}'",
                        logic.device_name()
                    ))
                })?;
            scanners.push(DeviceScanner::new(logic, interval, sim.fault_threshold));
        }
        scanners.sort_by(|a, b| a.device_name().cmp(b.device_name()));

        // 6. Topology and gate
        let topology = Topology::load(&config.topology, &fabric)?;
        let connections = Arc::new(ConnectionLog::new(Arc::clone(&clock)));
        let gate = NetworkGate::new(
            topology,
            config.topology.allow_rules.clone(),
            connections,
            Arc::clone(&events),
        );

        // 7 + 8. Listeners: build, start, register services at their
        // actual bound ports.
        let mut listeners: Vec<Box<dyn ProtocolServer>> = Vec::new();
        for spec in &config.devices {
            for ls in &spec.listeners {
                let listener = build_listener(spec, ls, &gate);
                let Some(listener) = listener else {
                    warn!(
                        device = %spec.name,
                        protocol = %ls.protocol,
                        "Unknown protocol, listener skipped"
                    );
                    continue;
                };
                match listener.start().await {
                    Ok(()) => {
                        let port = listener
                            .local_addr()
                            .map(|a| a.port())
                            .unwrap_or(ls.port);
                        gate.with_topology(|t| {
                            t.expose_service(&spec.name, &ls.protocol, port)
                        });
                        listeners.push(listener);
                    }
                    Err(e @ CoreError::BindFailed { .. }) => {
                        // The rest of the plant stays usable
                        error!(
                            device = %spec.name,
                            protocol = %ls.protocol,
                            port = ls.port,
                            error = %e,
                            "Listener bind failed, continuing without it"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        listeners.sort_by(|a, b| {
            a.device_name()
                .cmp(b.device_name())
                .then_with(|| a.protocol().cmp(b.protocol()))
        });

        // 9. Clock last: nothing moves until boot has fully assembled.
        clock.start();
        info!(
            devices = config.devices.len(),
            engines = engines.len(),
            scanners = scanners.len(),
            listeners = listeners.len(),
            mode = sim.clock_mode.as_str(),
            "Plant booted"
        );

        Ok(Self {
            clock,
            fabric,
            events,
            gate,
            engines,
            scanners,
            listeners,
            grid_tied_generators: parts.grid_tied_generators,
            faulted_engines: HashSet::new(),
            last_tick_time: 0.0,
            started: true,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    pub fn fabric(&self) -> &Arc<StateFabric> {
        &self.fabric
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn gate(&self) -> &Arc<NetworkGate> {
        &self.gate
    }

    pub fn listener_addr(&self, device: &str, protocol: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.device_name() == device && l.protocol() == protocol)
            .and_then(|l| l.local_addr())
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "devices": self.fabric.summary(),
            "clock": self.clock.status(),
            "connections": {
                "active": self.gate.connections().active_count(),
                "allowed": self.gate.total_allowed(),
                "denied": self.gate.total_denied(),
            },
            "listeners": self.listeners.iter().map(|l| {
                serde_json::json!({
                    "device": l.device_name(),
                    "protocol": l.protocol(),
                    "addr": l.local_addr().map(|a| a.to_string()),
                })
            }).collect::<Vec<_>>(),
        })
    }

    // ── Tick loop ───────────────────────────────────────────────────────

    /// Advance one tick in stepped mode: move the clock by `dt`, then run
    /// the full causal cycle.
    pub fn step(&mut self, dt: f64) -> CoreResult<()> {
        self.clock.step(dt)?;
        self.run_tick(dt);
        Ok(())
    }

    /// One tick against whatever time the clock has accumulated since the
    /// previous call. Used by the realtime loop.
    pub fn tick_once(&mut self) {
        let now = self.clock.now();
        let dt = now - self.last_tick_time;
        if dt > 0.0 {
            self.run_tick(dt);
        }
    }

    /// Physics → scans → protocol sync, in that order, everything in
    /// stable device order.
    fn run_tick(&mut self, dt: f64) {
        let now = self.clock.now();
        self.last_tick_time = now;

        // Physics
        let mut pending_events: Vec<KernelEvent> = Vec::new();
        for engine in &mut self.engines {
            let device = engine.device_name().to_string();
            if self.faulted_engines.contains(&device) {
                continue;
            }
            if let Err(e) = engine.read_controls(&self.fabric) {
                warn!(device = %device, error = %e, "Control staging failed");
                continue;
            }
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| engine.update(dt)));
            if outcome.is_err() {
                error!(device = %device, "Physics engine panicked, faulting device");
                self.faulted_engines.insert(device.clone());
                let _ = self.fabric.set_online(&device, false);
                self.events.publish(KernelEvent::DeviceFaulted {
                    device,
                    consecutive_failures: 1,
                });
                continue;
            }
            if let Err(e) = engine.write_telemetry(&self.fabric) {
                warn!(device = %device, error = %e, "Telemetry publish failed");
            }
            pending_events.extend(engine.drain_events());
        }
        for event in pending_events {
            if let KernelEvent::GridTrip { .. } = &event {
                self.fan_out_grid_trip();
            }
            self.events.publish(event);
        }

        // Scan machines
        let ctx = ScanContext {
            fabric: &self.fabric,
            events: &self.events,
            now,
        };
        for scanner in &mut self.scanners {
            scanner.run_if_due(&ctx);
        }

        // Protocol sync: harvest client writes, apply, push telemetry
        for listener in &self.listeners {
            let device = listener.device_name();
            let writes = listener.mirror().drain_writes();
            if !writes.is_empty() {
                if let Err(e) = self.fabric.write_bulk(device, &writes) {
                    warn!(device, error = %e, "Applying client writes failed");
                }
            }
            match self.fabric.read_bulk(device) {
                Ok(snapshot) => listener.mirror().push_telemetry(&snapshot),
                Err(e) => warn!(device, error = %e, "Telemetry push failed"),
            }
        }

        self.clock.increment_cycles();
    }

    /// Assert the emergency trip coil on every grid-tied generator.
    fn fan_out_grid_trip(&self) {
        for device in &self.grid_tied_generators {
            warn!(device = %device, "Grid trip, tripping tied generator");
            if let Err(e) = self.fabric.write(
                device,
                gridforge_physics::turbine::COIL_EMERGENCY_TRIP,
                MemValue::Bit(true),
            ) {
                warn!(device = %device, error = %e, "Generator trip failed");
            }
        }
    }

    /// Realtime/accelerated drive loop. Returns when `shutdown` resolves.
    pub async fn run(&mut self, shutdown: impl std::future::Future<Output = ()>) {
        let interval = self.clock.update_interval();
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs_f64(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick_once(),
                _ = &mut shutdown => break,
            }
        }
    }

    /// Drain gracefully: listeners first, then the clock. The fabric and
    /// event log stay readable for post-run inspection.
    pub async fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        info!("Shutting down: stopping listeners");
        for listener in &self.listeners {
            listener.stop().await;
        }
        self.clock.stop();
        info!(
            cycles = self.clock.cycles(),
            sim_time = self.clock.now(),
            "Shutdown complete"
        );
    }
}

/// Build the listener matching a protocol tag, or `None` for an unknown
/// tag.
fn build_listener(
    spec: &gridforge_core::config::DeviceSpec,
    ls: &gridforge_core::config::ListenerSpec,
    gate: &Arc<NetworkGate>,
) -> Option<Box<dyn ProtocolServer>> {
    let gate = Arc::clone(gate);
    let device = spec.name.as_str();
    let metadata = &spec.metadata;
    let meta = |key: &str, default: &str| {
        metadata
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };
    match ls.protocol.as_str() {
        "modbus" => {
            let sizes = metadata
                .get("modbus_map_size")
                .and_then(|s| s.parse::<u16>().ok())
                .map(MirrorSizes::uniform)
                .unwrap_or_default();
            let identity = DeviceIdentity {
                vendor_name: meta("vendor", "Gridforge Controls"),
                product_code: meta("product", "GF-PLC-4000"),
                revision: meta("revision", "2.1"),
            };
            Some(Box::new(ModbusTcpListener::new(
                device, &ls.host, ls.port, ls.unit_id, sizes, identity, gate,
            )))
        }
        "s7" => Some(Box::new(s7_listener(device, &ls.host, ls.port, gate))),
        "dnp3" => Some(Box::new(dnp3_listener(
            device,
            &ls.host,
            ls.port,
            ls.unit_id as u16,
            gate,
        ))),
        "iec104" => Some(Box::new(iec104_listener(device, &ls.host, ls.port, gate))),
        "opcua" => Some(Box::new(opcua_listener(device, &ls.host, ls.port, gate))),
        "enip" => Some(Box::new(enip_listener(
            device,
            &ls.host,
            ls.port,
            0x0142,
            0x0065,
            &meta("product", "GF-CLX-5000"),
            gate,
        ))),
        _ => None,
    }
}
