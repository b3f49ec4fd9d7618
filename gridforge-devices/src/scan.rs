//! # Scan machinery — scheduling and fault containment
//!
//! A `DeviceScanner` wraps one device's logic with its scan interval and
//! failure accounting. The orchestrator calls `run_if_due` every tick;
//! rescheduling is relative to the due time (not the actual run time) so
//! stepped replays land scans on identical boundaries.

use crate::historian::HistorianLogic;
use crate::hmi::HmiLogic;
use crate::plc::PlcLogic;
use crate::safety::TurbineSafetyLogic;
use crate::scada::ScadaLogic;
use gridforge_core::{CoreResult, EventLog, KernelEvent, StateFabric};
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// Everything a scan cycle is allowed to touch.
pub struct ScanContext<'a> {
    pub fabric: &'a StateFabric,
    pub events: &'a EventLog,
    /// Simulation time of this tick.
    pub now: f64,
}

/// The closed set of device behaviors.
pub enum DeviceLogic {
    Plc(PlcLogic),
    Safety(TurbineSafetyLogic),
    Scada(ScadaLogic),
    Hmi(HmiLogic),
    Historian(HistorianLogic),
}

impl DeviceLogic {
    pub fn device_name(&self) -> &str {
        match self {
            DeviceLogic::Plc(l) => l.device_name(),
            DeviceLogic::Safety(l) => l.device_name(),
            DeviceLogic::Scada(l) => l.device_name(),
            DeviceLogic::Hmi(l) => l.device_name(),
            DeviceLogic::Historian(l) => l.device_name(),
        }
    }

    fn scan(&mut self, ctx: &ScanContext) -> CoreResult<()> {
        match self {
            DeviceLogic::Plc(l) => l.scan(ctx),
            DeviceLogic::Safety(l) => l.scan(ctx),
            DeviceLogic::Scada(l) => l.scan(ctx),
            DeviceLogic::Hmi(l) => l.scan(ctx),
            DeviceLogic::Historian(l) => l.scan(ctx),
        }
    }
}

pub struct DeviceScanner {
    logic: DeviceLogic,
    /// Scan interval in simulation seconds.
    interval: f64,
    next_due: f64,
    consecutive_failures: u32,
    fault_threshold: u32,
    faulted: bool,
    scan_count: u64,
    error_count: u64,
}

impl DeviceScanner {
    pub fn new(logic: DeviceLogic, interval: f64, fault_threshold: u32) -> Self {
        Self {
            logic,
            interval: interval.max(1e-3),
            next_due: 0.0,
            consecutive_failures: 0,
            fault_threshold: fault_threshold.max(1),
            faulted: false,
            scan_count: 0,
            error_count: 0,
        }
    }

    pub fn device_name(&self) -> &str {
        self.logic.device_name()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn scan_count(&self) -> u64 {
        self.scan_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Run one scan cycle if the device is due. Returns whether it ran.
    pub fn run_if_due(&mut self, ctx: &ScanContext) -> bool {
        if self.faulted || ctx.now < self.next_due {
            return false;
        }
        // Reschedule off the due time so scans stay phase-locked; if the
        // simulator fell far behind, skip the backlog rather than burst.
        self.next_due += self.interval;
        if self.next_due <= ctx.now {
            self.next_due = ctx.now + self.interval;
        }

        match self.logic.scan(ctx) {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.scan_count += 1;
                self.publish_diagnostics(ctx);
                true
            }
            Err(e) => {
                self.error_count += 1;
                self.consecutive_failures += 1;
                warn!(
                    device = self.logic.device_name(),
                    error = %e,
                    consecutive = self.consecutive_failures,
                    "Scan cycle failed"
                );
                if self.consecutive_failures >= self.fault_threshold {
                    self.fault(ctx);
                }
                true
            }
        }
    }

    fn publish_diagnostics(&self, ctx: &ScanContext) {
        // Every 64 scans is plenty for metadata freshness
        if self.scan_count % 64 != 1 {
            return;
        }
        let fields = HashMap::from([
            ("scan_count".to_string(), self.scan_count.to_string()),
            ("error_count".to_string(), self.error_count.to_string()),
            ("last_scan_time".to_string(), format!("{:.3}", ctx.now)),
        ]);
        if let Err(e) = ctx.fabric.merge_metadata(self.logic.device_name(), fields) {
            debug!(device = self.logic.device_name(), error = %e, "Diagnostics update failed");
        }
    }

    fn fault(&mut self, ctx: &ScanContext) {
        self.faulted = true;
        let name = self.logic.device_name().to_string();
        error!(
            device = %name,
            failures = self.consecutive_failures,
            "Device faulted, taking offline"
        );
        if let Err(e) = ctx.fabric.set_online(&name, false) {
            warn!(device = %name, error = %e, "Could not mark faulted device offline");
        }
        ctx.events.publish(KernelEvent::DeviceFaulted {
            device: name,
            consecutive_failures: self.consecutive_failures,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plc::{PlcLogic, ProcessKind};
    use crate::safety::{TurbineSafetyLogic, TurbineSafetyParams};
    use gridforge_core::{DeviceKind, EventKind, SimClock};
    use std::collections::HashMap as Map;
    use std::sync::Arc;

    fn world() -> (Arc<StateFabric>, Arc<EventLog>) {
        let clock = SimClock::stepped();
        let fabric = StateFabric::new(clock.clone());
        let events = EventLog::new(clock);
        (fabric, events)
    }

    fn register(fabric: &StateFabric, name: &str, kind: DeviceKind) {
        fabric
            .register(name, kind, 1, vec!["modbus".into()], Map::new())
            .unwrap();
        fabric.set_online(name, true).unwrap();
    }

    #[test]
    fn test_scan_scheduling_is_interval_locked() {
        let (fabric, events) = world();
        register(&fabric, "plc_1", DeviceKind::Plc);
        let mut scanner = DeviceScanner::new(
            DeviceLogic::Plc(PlcLogic::new("plc_1", ProcessKind::Turbine, 3600.0)),
            0.5,
            5,
        );
        let mut runs = 0;
        for i in 0..100 {
            let now = i as f64 * 0.1;
            let ctx = ScanContext { fabric: &fabric, events: &events, now };
            if scanner.run_if_due(&ctx) {
                runs += 1;
            }
        }
        // 10 s of sim time at a 0.5 s interval
        assert_eq!(runs, 20);
        assert_eq!(scanner.scan_count(), 20);
        assert_eq!(scanner.error_count(), 0);
    }

    #[test]
    fn test_repeated_failures_fault_the_device() {
        let (fabric, events) = world();
        // The SIS monitors a turbine that was never registered, so every
        // scan fails with UnknownDevice.
        register(&fabric, "sis_1", DeviceKind::Sis);
        let mut scanner = DeviceScanner::new(
            DeviceLogic::Safety(TurbineSafetyLogic::new(
                "sis_1",
                "missing_turbine",
                TurbineSafetyParams::default(),
            )),
            0.1,
            5,
        );
        for i in 0..10 {
            let ctx = ScanContext {
                fabric: &fabric,
                events: &events,
                now: i as f64 * 0.1,
            };
            scanner.run_if_due(&ctx);
        }
        assert!(scanner.is_faulted());
        assert_eq!(events.count(EventKind::DeviceFaulted), 1);
        assert!(!fabric.is_online("sis_1").unwrap());
        // Faulted devices stay down — no more scans, no more events
        let ctx = ScanContext { fabric: &fabric, events: &events, now: 100.0 };
        assert!(!scanner.run_if_due(&ctx));
        assert_eq!(events.count(EventKind::DeviceFaulted), 1);
    }

    #[test]
    fn test_failure_streak_resets_on_success() {
        let (fabric, events) = world();
        register(&fabric, "sis_2", DeviceKind::Sis);
        let mut scanner = DeviceScanner::new(
            DeviceLogic::Safety(TurbineSafetyLogic::new(
                "sis_2",
                "late_turbine",
                TurbineSafetyParams::default(),
            )),
            0.1,
            5,
        );
        // Three failures, then the peer appears
        for i in 0..3 {
            let ctx = ScanContext {
                fabric: &fabric,
                events: &events,
                now: i as f64 * 0.1,
            };
            scanner.run_if_due(&ctx);
        }
        register(&fabric, "late_turbine", DeviceKind::Plc);
        for i in 3..12 {
            let ctx = ScanContext {
                fabric: &fabric,
                events: &events,
                now: i as f64 * 0.1,
            };
            scanner.run_if_due(&ctx);
        }
        assert!(!scanner.is_faulted());
        assert_eq!(events.count(EventKind::DeviceFaulted), 0);
        assert_eq!(scanner.error_count(), 3);
    }
}
