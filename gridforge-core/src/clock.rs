//! # Simulation Clock — single authoritative time source
//!
//! Every time-dependent computation in the kernel reads from one `SimClock`
//! handle passed down by the orchestrator. Four modes:
//! - **RealTime** — sim time tracks wall time 1:1
//! - **Accelerated** — sim time advances at `speed`× wall time
//! - **Stepped** — time only moves on explicit `step(dt)` calls
//! - **Paused** — frozen; resuming re-anchors the wall base so there is no
//!   retroactive jump
//!
//! RealTime and Accelerated are driven by a background task ticking every
//! `update_interval` wall seconds. Stepped mode is what makes scenario
//! replays deterministic.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Safety cap on the acceleration multiplier.
pub const MAX_SPEED: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ClockMode {
    RealTime,
    Accelerated,
    Stepped,
    Paused,
}

impl ClockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockMode::RealTime => "realtime",
            ClockMode::Accelerated => "accelerated",
            ClockMode::Stepped => "stepped",
            ClockMode::Paused => "paused",
        }
    }
}

struct TimeState {
    sim_time: f64,
    wall_start: Instant,
    last_tick: Instant,
    total_pause: f64,
    pause_start: Option<Instant>,
    mode: ClockMode,
    speed: f64,
    paused: bool,
    update_interval: f64,
}

/// Authoritative simulation time. Cheap to share as `Arc<SimClock>`.
pub struct SimClock {
    state: Mutex<TimeState>,
    running: AtomicBool,
    cycles: AtomicU64,
    advance_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SimClock {
    pub fn new(mode: ClockMode, speed: f64, update_interval: f64) -> Arc<Self> {
        let speed = if speed <= 0.0 {
            warn!(speed, "Invalid clock speed, using 1.0");
            1.0
        } else if speed > MAX_SPEED {
            warn!(speed, cap = MAX_SPEED, "Clock speed capped");
            MAX_SPEED
        } else {
            speed
        };
        let update_interval = if update_interval <= 0.0 {
            warn!(update_interval, "Invalid update interval, using default");
            crate::DEFAULT_UPDATE_INTERVAL
        } else {
            update_interval
        };

        let now = Instant::now();
        info!(mode = mode.as_str(), speed, update_interval, "Clock configured");
        Arc::new(Self {
            state: Mutex::new(TimeState {
                sim_time: 0.0,
                wall_start: now,
                last_tick: now,
                total_pause: 0.0,
                pause_start: None,
                mode,
                speed,
                paused: mode == ClockMode::Paused,
                update_interval,
            }),
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            advance_task: Mutex::new(None),
        })
    }

    /// Stepped clock at 1× — the configuration every deterministic test uses.
    pub fn stepped() -> Arc<Self> {
        Self::new(ClockMode::Stepped, 1.0, crate::DEFAULT_UPDATE_INTERVAL)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Begin advancing time. Spawns the advance task for RealTime and
    /// Accelerated modes; Stepped and Paused have nothing to drive.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Clock already running");
            return;
        }
        {
            let mut s = self.state.lock();
            let now = Instant::now();
            s.wall_start = now;
            s.last_tick = now;
            s.sim_time = 0.0;
            s.total_pause = 0.0;
            s.pause_start = None;
            s.paused = s.mode == ClockMode::Paused;
        }

        let mode = self.state.lock().mode;
        if matches!(mode, ClockMode::RealTime | ClockMode::Accelerated) {
            let clock = Arc::clone(self);
            let interval = self.state.lock().update_interval;
            let handle = tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs_f64(interval));
                ticker.set_missed_tick_behavior(
                    tokio::time::MissedTickBehavior::Delay,
                );
                while clock.running.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    clock.advance_wall();
                }
            });
            *self.advance_task.lock() = Some(handle);
        }
        info!(mode = mode.as_str(), "Clock started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.advance_task.lock().take() {
            handle.abort();
        }
        info!("Clock stopped");
    }

    /// Reset time to zero, preserving mode and speed.
    pub fn reset(&self) {
        let mut s = self.state.lock();
        let now = Instant::now();
        s.sim_time = 0.0;
        s.wall_start = now;
        s.last_tick = now;
        s.total_pause = 0.0;
        s.pause_start = None;
        info!("Clock reset to zero");
    }

    fn advance_wall(&self) {
        let mut s = self.state.lock();
        let now = Instant::now();
        let wall_delta = now.duration_since(s.last_tick).as_secs_f64();
        s.last_tick = now;
        if s.paused {
            return;
        }
        let multiplier = match s.mode {
            ClockMode::RealTime => 1.0,
            ClockMode::Accelerated => s.speed,
            ClockMode::Stepped | ClockMode::Paused => 0.0,
        };
        s.sim_time += wall_delta * multiplier;
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Current simulation time in seconds. Non-blocking, monotonic.
    pub fn now(&self) -> f64 {
        self.state.lock().sim_time
    }

    /// Total elapsed simulation time since start/reset.
    pub fn elapsed(&self) -> f64 {
        self.now()
    }

    /// Wall-clock seconds since start, excluding time spent paused.
    pub fn wall_elapsed(&self) -> f64 {
        let s = self.state.lock();
        let mut elapsed = s.wall_start.elapsed().as_secs_f64() - s.total_pause;
        if let Some(p) = s.pause_start {
            elapsed -= p.elapsed().as_secs_f64();
        }
        elapsed.max(0.0)
    }

    pub fn mode(&self) -> ClockMode {
        self.state.lock().mode
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn update_interval(&self) -> f64 {
        self.state.lock().update_interval
    }

    /// Orchestrator tick counter.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn increment_cycles(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    // ── Control ─────────────────────────────────────────────────────────

    pub fn set_mode(&self, mode: ClockMode) {
        let mut s = self.state.lock();
        let old = s.mode;
        s.mode = mode;
        match mode {
            ClockMode::Paused => {
                if !s.paused {
                    s.paused = true;
                    s.pause_start = Some(Instant::now());
                }
            }
            _ => {
                if s.paused {
                    if let Some(p) = s.pause_start.take() {
                        s.total_pause += p.elapsed().as_secs_f64();
                    }
                    s.paused = false;
                    s.last_tick = Instant::now();
                }
            }
        }
        info!(from = old.as_str(), to = mode.as_str(), "Clock mode changed");
    }

    pub fn set_speed(&self, multiplier: f64) -> CoreResult<()> {
        if multiplier <= 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "speed multiplier must be > 0, got {multiplier}"
            )));
        }
        if multiplier > MAX_SPEED {
            return Err(CoreError::InvalidConfig(format!(
                "speed multiplier {multiplier} exceeds maximum {MAX_SPEED}"
            )));
        }
        let mut s = self.state.lock();
        let old = s.speed;
        s.speed = multiplier;
        s.last_tick = Instant::now();
        info!(old, new = multiplier, "Clock speed changed");
        Ok(())
    }

    pub fn pause(&self) {
        let mut s = self.state.lock();
        if s.paused {
            warn!("Clock already paused");
            return;
        }
        s.paused = true;
        s.pause_start = Some(Instant::now());
        info!("Clock paused");
    }

    /// Resume after pause. The wall base is re-anchored so the pause window
    /// does not replay into simulation time.
    pub fn resume(&self) {
        let mut s = self.state.lock();
        if !s.paused {
            warn!("Clock not paused");
            return;
        }
        s.paused = false;
        if let Some(p) = s.pause_start.take() {
            s.total_pause += p.elapsed().as_secs_f64();
        }
        s.last_tick = Instant::now();
        info!("Clock resumed");
    }

    /// Manually advance simulation time. Stepped mode only.
    pub fn step(&self, dt: f64) -> CoreResult<()> {
        if dt < 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "cannot step negative time: {dt}"
            )));
        }
        let mut s = self.state.lock();
        if s.mode != ClockMode::Stepped {
            return Err(CoreError::InvalidMode {
                mode: s.mode.as_str().into(),
                operation: "step".into(),
            });
        }
        s.sim_time += dt;
        debug!(dt, sim_time = s.sim_time, "Clock stepped");
        Ok(())
    }

    /// Cooperative wait that returns once simulation time has advanced by
    /// at least `dt`. In Stepped mode this blocks until enough `step` calls
    /// have occurred.
    pub async fn sleep_sim(&self, dt: f64) -> CoreResult<()> {
        if dt < 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "cannot wait negative time: {dt}"
            )));
        }
        if dt == 0.0 {
            return Ok(());
        }
        let target = self.now() + dt;
        loop {
            if self.now() >= target {
                return Ok(());
            }
            let (interval, speed, paused) = {
                let s = self.state.lock();
                (s.update_interval, s.speed, s.paused)
            };
            let wall_wait = if paused {
                0.1
            } else {
                let remaining = (target - self.now()).max(0.0);
                interval.min(remaining / speed.max(1e-9)).max(0.001)
            };
            tokio::time::sleep(Duration::from_secs_f64(wall_wait)).await;
        }
    }

    pub fn status(&self) -> serde_json::Value {
        let s = self.state.lock();
        let wall = {
            let mut w = s.wall_start.elapsed().as_secs_f64() - s.total_pause;
            if let Some(p) = s.pause_start {
                w -= p.elapsed().as_secs_f64();
            }
            w.max(0.0)
        };
        serde_json::json!({
            "simulation_time": s.sim_time,
            "wall_elapsed": wall,
            "mode": s.mode.as_str(),
            "speed": s.speed,
            "paused": s.paused,
            "cycles": self.cycles.load(Ordering::Relaxed),
            "ratio": if wall > 0.0 { s.sim_time / wall } else { 0.0 },
        })
    }
}

impl Drop for SimClock {
    fn drop(&mut self) {
        if let Some(handle) = self.advance_task.lock().take() {
            handle.abort();
        }
    }
}
