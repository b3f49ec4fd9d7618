//! # SCADA Master — tag polling, alarm management
//!
//! Polls peer devices through the fabric into a central tag database and
//! evaluates alarm limits with hysteresis. The tag database is shared
//! (`Arc<TagDb>`) so HMI and historian devices read the same live table
//! an operator console would.
//!
//! Own memory map: input registers 0..=3 publish poll statistics, coil 0
//! is an acknowledge-all command.

use crate::scan::ScanContext;
use gridforge_core::{CoreResult, MemKey, MemValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const IR_POLL_COUNT_LO: MemKey = MemKey::input(0);
pub const IR_POLL_COUNT_HI: MemKey = MemKey::input(1);
pub const IR_FAILED_POLLS: MemKey = MemKey::input(2);
pub const IR_ACTIVE_ALARMS: MemKey = MemKey::input(3);
pub const COIL_ACK_ALL: MemKey = MemKey::coil(0);

const MAX_ALARM_HISTORY: usize = 1000;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TagDefinition {
    pub tag_name: String,
    pub device: String,
    pub address: MemKey,
    /// Per-tag poll period, simulation seconds.
    pub poll_period: f64,
    pub alarm_high: Option<f64>,
    pub alarm_low: Option<f64>,
    /// Band below/above the limit a value must re-enter to clear.
    pub hysteresis: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TagQuality {
    Good,
    Bad,
    Uncertain,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TagSample {
    pub value: f64,
    pub quality: TagQuality,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AlarmKind {
    High,
    Low,
    CommsFailure,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Alarm {
    pub tag_name: String,
    pub kind: AlarmKind,
    pub triggered_at: f64,
    pub value: f64,
    pub acknowledged: bool,
}

/// Live tag table shared between SCADA, HMI, and historian devices.
#[derive(Default)]
pub struct TagDb {
    samples: RwLock<HashMap<String, TagSample>>,
}

impl TagDb {
    pub fn get(&self, tag: &str) -> Option<TagSample> {
        self.samples.read().get(tag).cloned()
    }

    pub fn all(&self) -> HashMap<String, TagSample> {
        self.samples.read().clone()
    }

    pub fn tag_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.samples.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn store(&self, tag: &str, sample: TagSample) {
        self.samples.write().insert(tag.to_string(), sample);
    }
}

struct PolledTag {
    def: TagDefinition,
    last_polled: f64,
    alarm_high_active: bool,
    alarm_low_active: bool,
}

pub struct ScadaLogic {
    device: String,
    tags: Vec<PolledTag>,
    db: Arc<TagDb>,
    active_alarms: Vec<Alarm>,
    alarm_history: Vec<Alarm>,
    poll_count: u64,
    failed_polls: u64,
}

impl ScadaLogic {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            tags: Vec::new(),
            db: Arc::new(TagDb::default()),
            active_alarms: Vec::new(),
            alarm_history: Vec::new(),
            poll_count: 0,
            failed_polls: 0,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    /// Handle to the live tag table, shared with HMI/historian devices.
    pub fn tag_db(&self) -> Arc<TagDb> {
        Arc::clone(&self.db)
    }

    pub fn add_tag(&mut self, def: TagDefinition) {
        debug!(
            device = %self.device,
            tag = %def.tag_name,
            source = %def.device,
            address = %def.address,
            "Tag added"
        );
        self.tags.push(PolledTag {
            def,
            last_polled: f64::NEG_INFINITY,
            alarm_high_active: false,
            alarm_low_active: false,
        });
    }

    pub fn active_alarms(&self) -> &[Alarm] {
        &self.active_alarms
    }

    pub fn alarm_history(&self) -> &[Alarm] {
        &self.alarm_history
    }

    fn raise_alarm(&mut self, tag: &str, kind: AlarmKind, now: f64, value: f64) {
        warn!(device = %self.device, tag, ?kind, value, "Alarm raised");
        let alarm = Alarm {
            tag_name: tag.to_string(),
            kind,
            triggered_at: now,
            value,
            acknowledged: false,
        };
        self.active_alarms.push(alarm.clone());
        if self.alarm_history.len() >= MAX_ALARM_HISTORY {
            self.alarm_history.remove(0);
        }
        self.alarm_history.push(alarm);
    }

    fn clear_alarm(&mut self, tag: &str, kind: AlarmKind) {
        info!(device = %self.device, tag, ?kind, "Alarm cleared");
        self.active_alarms
            .retain(|a| !(a.tag_name == tag && a.kind == kind));
    }

    pub fn scan(&mut self, ctx: &ScanContext) -> CoreResult<()> {
        let own = ctx.fabric.read_bulk(&self.device)?;

        // Poll due tags
        for i in 0..self.tags.len() {
            let due = {
                let tag = &self.tags[i];
                ctx.now - tag.last_polled >= tag.def.poll_period
            };
            if !due {
                continue;
            }
            self.tags[i].last_polled = ctx.now;
            self.poll_count += 1;

            let (tag_name, device, address) = {
                let d = &self.tags[i].def;
                (d.tag_name.clone(), d.device.clone(), d.address)
            };

            let value = match ctx.fabric.read(&device, address) {
                Ok(Some(MemValue::Word(w))) => Some(w as f64),
                Ok(Some(MemValue::Bit(b))) => Some(if b { 1.0 } else { 0.0 }),
                Ok(None) => None,
                Err(e) => {
                    debug!(device = %self.device, tag = %tag_name, error = %e, "Poll failed");
                    None
                }
            };

            match value {
                Some(v) => {
                    self.db.store(
                        &tag_name,
                        TagSample {
                            value: v,
                            quality: TagQuality::Good,
                            timestamp: ctx.now,
                        },
                    );
                    self.evaluate_limits(i, &tag_name, v, ctx.now);
                }
                None => {
                    self.failed_polls += 1;
                    self.db.store(
                        &tag_name,
                        TagSample {
                            value: 0.0,
                            quality: TagQuality::Bad,
                            timestamp: ctx.now,
                        },
                    );
                    if !self
                        .active_alarms
                        .iter()
                        .any(|a| a.tag_name == tag_name && a.kind == AlarmKind::CommsFailure)
                    {
                        self.raise_alarm(&tag_name, AlarmKind::CommsFailure, ctx.now, 0.0);
                    }
                }
            }
        }

        // Acknowledge-all command from the wire
        if own.bit(COIL_ACK_ALL) {
            let count = self.active_alarms.len();
            for alarm in &mut self.active_alarms {
                alarm.acknowledged = true;
            }
            info!(device = %self.device, count, "All alarms acknowledged");
            ctx.fabric
                .write(&self.device, COIL_ACK_ALL, MemValue::Bit(false))?;
        }

        ctx.fabric.write_bulk(
            &self.device,
            &[
                (IR_POLL_COUNT_LO, MemValue::Word(self.poll_count as u16)),
                (
                    IR_POLL_COUNT_HI,
                    MemValue::Word((self.poll_count >> 16) as u16),
                ),
                (
                    IR_FAILED_POLLS,
                    MemValue::Word(self.failed_polls.min(u16::MAX as u64) as u16),
                ),
                (
                    IR_ACTIVE_ALARMS,
                    MemValue::Word(self.active_alarms.len() as u16),
                ),
            ],
        )
    }

    fn evaluate_limits(&mut self, index: usize, tag: &str, value: f64, now: f64) {
        let (high, low, hyst, high_active, low_active) = {
            let t = &self.tags[index];
            (
                t.def.alarm_high,
                t.def.alarm_low,
                t.def.hysteresis,
                t.alarm_high_active,
                t.alarm_low_active,
            )
        };

        // Comms restored clears any failure alarm on this tag
        if self
            .active_alarms
            .iter()
            .any(|a| a.tag_name == tag && a.kind == AlarmKind::CommsFailure)
        {
            self.clear_alarm(tag, AlarmKind::CommsFailure);
        }

        if let Some(limit) = high {
            if !high_active && value > limit {
                self.tags[index].alarm_high_active = true;
                self.raise_alarm(tag, AlarmKind::High, now, value);
            } else if high_active && value < limit - hyst {
                self.tags[index].alarm_high_active = false;
                self.clear_alarm(tag, AlarmKind::High);
            }
        }
        if let Some(limit) = low {
            if !low_active && value < limit {
                self.tags[index].alarm_low_active = true;
                self.raise_alarm(tag, AlarmKind::Low, now, value);
            } else if low_active && value > limit + hyst {
                self.tags[index].alarm_low_active = false;
                self.clear_alarm(tag, AlarmKind::Low);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanContext;
    use gridforge_core::{DeviceKind, EventLog, SimClock, StateFabric};
    use std::collections::HashMap as Map;
    use std::sync::Arc;

    fn world() -> (Arc<StateFabric>, Arc<EventLog>) {
        let clock = SimClock::stepped();
        let fabric = StateFabric::new(clock.clone());
        let events = EventLog::new(clock);
        for (name, kind) in [
            ("turbine_plc_1", DeviceKind::Plc),
            ("scada_master_1", DeviceKind::Scada),
        ] {
            fabric
                .register(name, kind, 1, vec!["modbus".into()], Map::new())
                .unwrap();
        }
        (fabric, events)
    }

    fn speed_tag() -> TagDefinition {
        TagDefinition {
            tag_name: "TURB1_SPEED".into(),
            device: "turbine_plc_1".into(),
            address: MemKey::holding(0),
            poll_period: 0.1,
            alarm_high: Some(3960.0),
            alarm_low: None,
            hysteresis: 60.0,
            unit: "rpm".into(),
        }
    }

    fn scan(scada: &mut ScadaLogic, fabric: &StateFabric, events: &EventLog, now: f64) {
        let ctx = ScanContext { fabric, events, now };
        scada.scan(&ctx).unwrap();
    }

    #[test]
    fn test_tag_polling_respects_period() {
        let (fabric, events) = world();
        let mut scada = ScadaLogic::new("scada_master_1");
        let mut def = speed_tag();
        def.poll_period = 1.0;
        scada.add_tag(def);
        fabric
            .write("turbine_plc_1", MemKey::holding(0), MemValue::Word(3600))
            .unwrap();

        for i in 0..10 {
            scan(&mut scada, &fabric, &events, i as f64 * 0.25);
        }
        // 2.25 s of sim time at a 1 s poll period → polls at 0, 1.0, 2.0
        assert_eq!(scada.poll_count, 3);
        let sample = scada.tag_db().get("TURB1_SPEED").unwrap();
        assert_eq!(sample.value, 3600.0);
        assert_eq!(sample.quality, TagQuality::Good);
    }

    #[test]
    fn test_high_alarm_with_hysteresis() {
        let (fabric, events) = world();
        let mut scada = ScadaLogic::new("scada_master_1");
        scada.add_tag(speed_tag());

        fabric
            .write("turbine_plc_1", MemKey::holding(0), MemValue::Word(4000))
            .unwrap();
        scan(&mut scada, &fabric, &events, 0.0);
        assert_eq!(scada.active_alarms().len(), 1);
        assert_eq!(scada.active_alarms()[0].kind, AlarmKind::High);

        // Back inside the hysteresis band: alarm must persist
        fabric
            .write("turbine_plc_1", MemKey::holding(0), MemValue::Word(3940))
            .unwrap();
        scan(&mut scada, &fabric, &events, 0.2);
        assert_eq!(scada.active_alarms().len(), 1);

        // Below limit − hysteresis: alarm clears
        fabric
            .write("turbine_plc_1", MemKey::holding(0), MemValue::Word(3800))
            .unwrap();
        scan(&mut scada, &fabric, &events, 0.4);
        assert!(scada.active_alarms().is_empty());
        assert_eq!(scada.alarm_history().len(), 1);
    }

    #[test]
    fn test_comms_failure_alarm_and_recovery() {
        let (fabric, events) = world();
        let mut scada = ScadaLogic::new("scada_master_1");
        let mut def = speed_tag();
        def.device = "ghost_plc".into();
        def.tag_name = "GHOST_SPEED".into();
        scada.add_tag(def);

        scan(&mut scada, &fabric, &events, 0.0);
        assert_eq!(scada.active_alarms().len(), 1);
        assert_eq!(scada.active_alarms()[0].kind, AlarmKind::CommsFailure);
        assert_eq!(
            scada.tag_db().get("GHOST_SPEED").unwrap().quality,
            TagQuality::Bad
        );
        // Repeated failures do not stack duplicate alarms
        scan(&mut scada, &fabric, &events, 0.2);
        assert_eq!(scada.active_alarms().len(), 1);
    }

    #[test]
    fn test_ack_all_command() {
        let (fabric, events) = world();
        let mut scada = ScadaLogic::new("scada_master_1");
        scada.add_tag(speed_tag());
        fabric
            .write("turbine_plc_1", MemKey::holding(0), MemValue::Word(4000))
            .unwrap();
        scan(&mut scada, &fabric, &events, 0.0);
        assert!(!scada.active_alarms()[0].acknowledged);

        fabric
            .write("scada_master_1", COIL_ACK_ALL, MemValue::Bit(true))
            .unwrap();
        scan(&mut scada, &fabric, &events, 0.2);
        assert!(scada.active_alarms()[0].acknowledged);
        // Command coil consumed
        assert!(!fabric
            .read("scada_master_1", COIL_ACK_ALL)
            .unwrap()
            .unwrap()
            .as_bit()
            .unwrap());
        let snap = fabric.read_bulk("scada_master_1").unwrap();
        assert_eq!(snap.word(IR_ACTIVE_ALARMS), 1);
    }
}
