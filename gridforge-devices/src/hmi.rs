//! # HMI Workstation — operator console over the SCADA tag table
//!
//! Polls the shared tag database at a faster rate than the SCADA scan and
//! drives a set of logical screens (no rendering here — a screen is a
//! named list of tags an operator would be looking at). Flags stale data
//! when the SCADA stops refreshing.

use crate::scada::{TagDb, TagSample};
use crate::scan::ScanContext;
use gridforge_core::{CoreResult, MemKey, MemValue};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tags older than this many seconds count as stale.
const STALE_AFTER_S: f64 = 5.0;

pub const IR_REFRESH_COUNT: MemKey = MemKey::input(0);
pub const IR_STALE_TAGS: MemKey = MemKey::input(1);
pub const DI_DATA_FRESH: MemKey = MemKey::discrete(0);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Screen {
    pub name: String,
    pub tags: Vec<String>,
}

pub struct HmiLogic {
    device: String,
    scada_device: String,
    db: Arc<TagDb>,
    screens: Vec<Screen>,
    current_screen: usize,
    /// Last values seen on the current screen.
    display: HashMap<String, TagSample>,
    refresh_count: u64,
}

impl HmiLogic {
    pub fn new(device: &str, scada_device: &str, db: Arc<TagDb>) -> Self {
        Self {
            device: device.to_string(),
            scada_device: scada_device.to_string(),
            db,
            screens: Vec::new(),
            current_screen: 0,
            display: HashMap::new(),
            refresh_count: 0,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    pub fn scada_device(&self) -> &str {
        &self.scada_device
    }

    pub fn add_screen(&mut self, name: &str, tags: Vec<String>) {
        self.screens.push(Screen {
            name: name.to_string(),
            tags,
        });
    }

    pub fn select_screen(&mut self, name: &str) -> bool {
        if let Some(i) = self.screens.iter().position(|s| s.name == name) {
            self.current_screen = i;
            debug!(device = %self.device, screen = name, "Screen selected");
            true
        } else {
            false
        }
    }

    pub fn current_screen(&self) -> Option<&Screen> {
        self.screens.get(self.current_screen)
    }

    pub fn displayed_value(&self, tag: &str) -> Option<&TagSample> {
        self.display.get(tag)
    }

    pub fn scan(&mut self, ctx: &ScanContext) -> CoreResult<()> {
        // Reading our own record keeps device-liveness semantics: a
        // deregistered HMI fails its scan like any other device.
        ctx.fabric.read_bulk(&self.device)?;
        self.refresh_count += 1;

        let mut stale = 0u16;
        if let Some(screen) = self.screens.get(self.current_screen) {
            for tag in &screen.tags {
                match self.db.get(tag) {
                    Some(sample) => {
                        if ctx.now - sample.timestamp > STALE_AFTER_S {
                            stale += 1;
                        }
                        self.display.insert(tag.clone(), sample);
                    }
                    None => {
                        stale += 1;
                    }
                }
            }
        }
        if stale > 0 {
            warn!(
                device = %self.device,
                scada = %self.scada_device,
                stale,
                "Stale tags on display"
            );
        }

        ctx.fabric.write_bulk(
            &self.device,
            &[
                (IR_REFRESH_COUNT, MemValue::Word(self.refresh_count as u16)),
                (IR_STALE_TAGS, MemValue::Word(stale)),
                (DI_DATA_FRESH, MemValue::Bit(stale == 0)),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scada::TagQuality;
    use crate::scan::ScanContext;
    use gridforge_core::{DeviceKind, EventLog, SimClock, StateFabric};
    use std::collections::HashMap as Map;

    fn world() -> (Arc<StateFabric>, Arc<EventLog>) {
        let clock = SimClock::stepped();
        let fabric = StateFabric::new(clock.clone());
        let events = EventLog::new(clock);
        fabric
            .register("hmi_operator_1", DeviceKind::Hmi, 1, vec![], Map::new())
            .unwrap();
        (fabric, events)
    }

    fn seed(db: &TagDb, tag: &str, value: f64, timestamp: f64) {
        db.store(
            tag,
            TagSample {
                value,
                quality: TagQuality::Good,
                timestamp,
            },
        );
    }

    #[test]
    fn test_displays_fresh_tags() {
        let (fabric, events) = world();
        let db = Arc::new(TagDb::default());
        seed(&db, "TURB1_SPEED", 3600.0, 0.9);
        seed(&db, "TURB1_POWER", 100.0, 0.9);

        let mut hmi = HmiLogic::new("hmi_operator_1", "scada_master_1", db);
        hmi.add_screen(
            "turbine_overview",
            vec!["TURB1_SPEED".into(), "TURB1_POWER".into()],
        );
        let ctx = ScanContext { fabric: &fabric, events: &events, now: 1.0 };
        hmi.scan(&ctx).unwrap();

        assert_eq!(hmi.displayed_value("TURB1_SPEED").unwrap().value, 3600.0);
        let snap = fabric.read_bulk("hmi_operator_1").unwrap();
        assert!(snap.bit(DI_DATA_FRESH));
        assert_eq!(snap.word(IR_STALE_TAGS), 0);
    }

    #[test]
    fn test_flags_stale_and_missing_tags() {
        let (fabric, events) = world();
        let db = Arc::new(TagDb::default());
        seed(&db, "TURB1_SPEED", 3600.0, 0.0);

        let mut hmi = HmiLogic::new("hmi_operator_1", "scada_master_1", db);
        hmi.add_screen(
            "turbine_overview",
            vec!["TURB1_SPEED".into(), "MISSING_TAG".into()],
        );
        // 10 s later the only seeded tag is stale and the other is absent
        let ctx = ScanContext { fabric: &fabric, events: &events, now: 10.0 };
        hmi.scan(&ctx).unwrap();

        let snap = fabric.read_bulk("hmi_operator_1").unwrap();
        assert!(!snap.bit(DI_DATA_FRESH));
        assert_eq!(snap.word(IR_STALE_TAGS), 2);
    }

    #[test]
    fn test_screen_selection() {
        let (fabric, events) = world();
        let db = Arc::new(TagDb::default());
        seed(&db, "REACT1_TEMP", 350.0, 0.0);
        let mut hmi = HmiLogic::new("hmi_operator_1", "scada_master_1", db);
        hmi.add_screen("turbine_overview", vec!["TURB1_SPEED".into()]);
        hmi.add_screen("reactor_overview", vec!["REACT1_TEMP".into()]);

        assert!(hmi.select_screen("reactor_overview"));
        assert!(!hmi.select_screen("nonexistent"));
        let ctx = ScanContext { fabric: &fabric, events: &events, now: 0.5 };
        hmi.scan(&ctx).unwrap();
        assert_eq!(hmi.current_screen().unwrap().name, "reactor_overview");
        assert!(hmi.displayed_value("REACT1_TEMP").is_some());
    }
}
