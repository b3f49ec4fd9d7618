//! # State Fabric — device registry and shared memory access
//!
//! Single source of truth for all simulated device state. Mutations are
//! serialized per device (one lock per record); readers of different
//! devices never contend. The tick loop and protocol sync are the only
//! writers of telemetry spaces; client writes arrive only through the
//! orchestrator's sync step.

use crate::clock::SimClock;
use crate::error::{CoreError, CoreResult};
use crate::memory::{MemKey, MemValue, MemoryMap, MemorySnapshot};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DeviceKind {
    Plc,
    Rtu,
    Hmi,
    Scada,
    Historian,
    Ied,
    Sis,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Plc => "plc",
            DeviceKind::Rtu => "rtu",
            DeviceKind::Hmi => "hmi",
            DeviceKind::Scada => "scada",
            DeviceKind::Historian => "historian",
            DeviceKind::Ied => "ied",
            DeviceKind::Sis => "sis",
        }
    }

    pub fn parse(text: &str) -> CoreResult<Self> {
        match text {
            "plc" => Ok(DeviceKind::Plc),
            "rtu" => Ok(DeviceKind::Rtu),
            "hmi" => Ok(DeviceKind::Hmi),
            "scada" => Ok(DeviceKind::Scada),
            "historian" => Ok(DeviceKind::Historian),
            "ied" => Ok(DeviceKind::Ied),
            "sis" => Ok(DeviceKind::Sis),
            other => Err(CoreError::InvalidConfig(format!(
                "unknown device kind '{other}'"
            ))),
        }
    }
}

/// One simulated device: identity, runtime status, memory map.
#[derive(Debug)]
pub struct DeviceRecord {
    pub name: String,
    pub kind: DeviceKind,
    pub device_id: u16,
    pub protocols: Vec<String>,
    pub online: bool,
    pub last_update: f64,
    pub metadata: HashMap<String, String>,
    pub memory: MemoryMap,
}

/// Fabric-wide status snapshot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeviceSummary {
    pub devices_total: usize,
    pub devices_online: usize,
    pub by_kind: BTreeMap<String, u64>,
    pub by_protocol: BTreeMap<String, u64>,
    pub sim_time: f64,
    pub cycles: u64,
}

pub struct StateFabric {
    devices: RwLock<HashMap<String, Arc<RwLock<DeviceRecord>>>>,
    clock: Arc<SimClock>,
}

impl StateFabric {
    pub fn new(clock: Arc<SimClock>) -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            clock,
        })
    }

    pub fn clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    // ── Registration ────────────────────────────────────────────────────

    pub fn register(
        &self,
        name: &str,
        kind: DeviceKind,
        device_id: u16,
        protocols: Vec<String>,
        metadata: HashMap<String, String>,
    ) -> CoreResult<()> {
        if name.is_empty() {
            return Err(CoreError::InvalidConfig("device name cannot be empty".into()));
        }
        let mut devices = self.devices.write();
        if devices.contains_key(name) {
            return Err(CoreError::DuplicateDevice(name.into()));
        }
        devices.insert(
            name.to_string(),
            Arc::new(RwLock::new(DeviceRecord {
                name: name.to_string(),
                kind,
                device_id,
                protocols: protocols.clone(),
                online: false,
                last_update: self.clock.now(),
                metadata,
                memory: MemoryMap::new(),
            })),
        );
        info!(
            device = name,
            kind = kind.as_str(),
            id = device_id,
            protocols = ?protocols,
            "Device registered"
        );
        Ok(())
    }

    fn record(&self, name: &str) -> CoreResult<Arc<RwLock<DeviceRecord>>> {
        self.devices
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownDevice(name.into()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.read().contains_key(name)
    }

    // ── Status ──────────────────────────────────────────────────────────

    pub fn set_online(&self, name: &str, online: bool) -> CoreResult<()> {
        let record = self.record(name)?;
        let mut dev = record.write();
        if dev.online != online {
            dev.online = online;
            dev.last_update = self.clock.now();
            info!(device = name, online, "Device status changed");
        }
        Ok(())
    }

    pub fn is_online(&self, name: &str) -> CoreResult<bool> {
        Ok(self.record(name)?.read().online)
    }

    pub fn device_id(&self, name: &str) -> CoreResult<u16> {
        Ok(self.record(name)?.read().device_id)
    }

    pub fn kind(&self, name: &str) -> CoreResult<DeviceKind> {
        Ok(self.record(name)?.read().kind)
    }

    // ── Memory access ───────────────────────────────────────────────────

    pub fn read(&self, name: &str, key: MemKey) -> CoreResult<Option<MemValue>> {
        Ok(self.record(name)?.read().memory.get(key))
    }

    /// Read via address string (canonical syntax or a device alias).
    pub fn read_addr(&self, name: &str, address: &str) -> CoreResult<Option<MemValue>> {
        let record = self.record(name)?;
        let dev = record.read();
        let key = dev.memory.resolve(address)?;
        Ok(dev.memory.get(key))
    }

    pub fn write(&self, name: &str, key: MemKey, value: MemValue) -> CoreResult<()> {
        let record = self.record(name)?;
        let mut dev = record.write();
        dev.memory.set(key, value)?;
        dev.last_update = self.clock.now();
        debug!(device = name, key = %key, ?value, "Memory write");
        Ok(())
    }

    /// Write via address string, resolving aliases to canonical keys first.
    pub fn write_addr(&self, name: &str, address: &str, value: MemValue) -> CoreResult<()> {
        let record = self.record(name)?;
        let mut dev = record.write();
        let key = dev.memory.resolve(address)?;
        dev.memory.set(key, value)?;
        dev.last_update = self.clock.now();
        Ok(())
    }

    pub fn read_bulk(&self, name: &str) -> CoreResult<MemorySnapshot> {
        Ok(self.record(name)?.read().memory.snapshot())
    }

    /// Apply a batch of writes under the device lock. Atomic with respect
    /// to any other read or write on the same device; not a system-wide
    /// transaction.
    pub fn write_bulk(&self, name: &str, writes: &[(MemKey, MemValue)]) -> CoreResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let record = self.record(name)?;
        let mut dev = record.write();
        dev.memory.apply(writes)?;
        dev.last_update = self.clock.now();
        debug!(device = name, count = writes.len(), "Bulk memory write");
        Ok(())
    }

    pub fn define_alias(&self, name: &str, alias: &str, key: MemKey) -> CoreResult<()> {
        let record = self.record(name)?;
        record.write().memory.define_alias(alias, key);
        Ok(())
    }

    // ── Metadata ────────────────────────────────────────────────────────

    pub fn metadata(&self, name: &str) -> CoreResult<HashMap<String, String>> {
        Ok(self.record(name)?.read().metadata.clone())
    }

    pub fn metadata_value(&self, name: &str, field: &str) -> CoreResult<Option<String>> {
        Ok(self.record(name)?.read().metadata.get(field).cloned())
    }

    /// Merge metadata fields (does not replace the whole map).
    pub fn merge_metadata(
        &self,
        name: &str,
        fields: HashMap<String, String>,
    ) -> CoreResult<()> {
        let record = self.record(name)?;
        let mut dev = record.write();
        dev.metadata.extend(fields);
        dev.last_update = self.clock.now();
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// All device names in sorted order — the stable iteration order used
    /// everywhere determinism matters.
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_by_kind(&self, kind: DeviceKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .read()
            .iter()
            .filter(|(_, rec)| rec.read().kind == kind)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn list_by_protocol(&self, protocol: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .read()
            .iter()
            .filter(|(_, rec)| rec.read().protocols.iter().any(|p| p == protocol))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn summary(&self) -> DeviceSummary {
        let devices = self.devices.read();
        let mut by_kind: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_protocol: BTreeMap<String, u64> = BTreeMap::new();
        let mut online = 0usize;
        for rec in devices.values() {
            let dev = rec.read();
            if dev.online {
                online += 1;
            }
            *by_kind.entry(dev.kind.as_str().to_string()).or_insert(0) += 1;
            for proto in &dev.protocols {
                *by_protocol.entry(proto.clone()).or_insert(0) += 1;
            }
        }
        DeviceSummary {
            devices_total: devices.len(),
            devices_online: online,
            by_kind,
            by_protocol,
            sim_time: self.clock.now(),
            cycles: self.clock.cycles(),
        }
    }

    /// Run a closure against a device record without cloning its memory.
    /// Used by scan logic that needs a consistent multi-field view.
    pub fn with_device<R>(
        &self,
        name: &str,
        f: impl FnOnce(&DeviceRecord) -> R,
    ) -> CoreResult<R> {
        let record = self.record(name)?;
        let dev = record.read();
        Ok(f(&dev))
    }

    pub fn reset(&self) {
        let mut devices = self.devices.write();
        let count = devices.len();
        devices.clear();
        warn!(cleared = count, "State fabric reset");
    }
}
